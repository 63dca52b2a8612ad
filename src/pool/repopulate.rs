//! Level-triggered controller that keeps the shared pool at its target size.
use std::time::Duration;

use log::*;
use tokio::{sync::watch, task::JoinHandle};

use super::{offer, pool_len};
use crate::{coordinator::SharedPool, driver::VmDriver, Result};

#[derive(Debug, Clone)]
pub struct Repopulator {
    shared: SharedPool,
    driver: VmDriver,
    target: usize,
    interval: Duration,
}

impl Repopulator {
    pub fn new(shared: SharedPool, driver: VmDriver, target: usize, interval: Duration) -> Self {
        Self {
            shared,
            driver,
            target,
            interval,
        }
    }

    /// One pass: create VMs until the pool is at target or a create fails.
    /// The lock is only held to read the length and to append, never while a
    /// VM is being created. Returns how many VMs were added.
    pub async fn tick(&self) -> Result<usize> {
        let mut added = 0;
        while pool_len(&self.shared).await? < self.target {
            let Some(id) = self.driver.create().await else {
                // logged by the driver; the next tick tries again
                break;
            };
            if offer(&self.shared, &self.driver, self.target, id).await? {
                added += 1;
            } else {
                break;
            }
        }
        Ok(added)
    }

    /// Run [`Repopulator::tick`] every interval until stopped. Only the
    /// hosting process ticks; the others stand by and check on the host, so
    /// whichever of them takes over starts filling the new pool right away.
    pub fn spawn(self) -> RepopulatorHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(
                "repopulating pool to {} every {:?}",
                self.target, self.interval
            );
            loop {
                if !self.shared.is_host() {
                    // touching the pool reruns the election if the host is gone
                    if let Err(e) = pool_len(&self.shared).await {
                        warn!("pool host unreachable: {e}");
                    }
                }
                if self.shared.is_host() {
                    match self.tick().await {
                        Ok(0) => (),
                        Ok(added) => debug!("repopulation added {added} VMs"),
                        Err(e) => warn!("repopulation tick failed: {e}"),
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => (),
                    _ = stopped.changed() => break,
                }
            }
        });
        RepopulatorHandle { stop, task }
    }
}

pub struct RepopulatorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RepopulatorHandle {
    /// Ask the loop to stop after its current tick and wait for it.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!("repopulation task failed: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
