//! Background teardown of leased VMs, off the request path.
use log::*;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{driver::VmDriver, VmId};

pub struct Reaper {
    sender: async_channel::Sender<VmId>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    driver: VmDriver,
}

impl Reaper {
    /// Start `workers` teardown tasks fed by a queue of `capacity` ids.
    pub fn spawn(driver: VmDriver, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = async_channel::bounded::<VmId>(capacity.max(1));
        let handles = (0..workers.max(1))
            .map(|n| {
                let receiver = receiver.clone();
                let driver = driver.clone();
                tokio::spawn(async move {
                    while let Ok(id) = receiver.recv().await {
                        driver.destroy(&id).await;
                    }
                    debug!("teardown worker {n} stopped");
                })
            })
            .collect();
        Self {
            sender,
            workers: Mutex::new(handles),
            driver,
        }
    }

    /// Queue `id` for destruction without waiting for it. When the queue is
    /// full or closed the teardown runs on a task of its own instead.
    pub fn schedule(&self, id: VmId) {
        debug!("scheduling teardown of {id}");
        if let Err(e) = self.sender.try_send(id) {
            let id = e.into_inner();
            warn!("teardown queue unavailable, destroying {id} on a detached task");
            let driver = self.driver.clone();
            tokio::spawn(async move { driver.destroy(&id).await });
        }
    }

    /// Number of teardowns waiting for a worker.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// Stop accepting work and wait until everything queued is destroyed.
    pub async fn close(&self) {
        self.sender.close();
        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("teardown worker failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::{DriverConfig, Spec},
        platform::recording::RecordingPlatform,
    };

    #[tokio::test]
    async fn every_scheduled_vm_is_destroyed_once() {
        crate::utils::init();
        let platform = Arc::new(RecordingPlatform::new());
        let driver = VmDriver::with_platform(
            Spec::default(),
            DriverConfig {
                use_sudo: false,
                ..Default::default()
            },
            platform.clone(),
        );
        let reaper = Reaper::spawn(driver, 2, 1);
        let ids: Vec<VmId> = (0..5).map(|_| VmId::mint()).collect();
        for id in &ids {
            reaper.schedule(id.clone());
        }
        reaper.close().await;
        // detached fallbacks may still be running
        for _ in 0..50 {
            if platform.removed().len() == ids.len() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let mut removed = platform.removed();
        removed.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(removed, expected);
    }
}
