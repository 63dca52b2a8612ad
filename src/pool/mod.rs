//! The warm pool: bootstrapping, leasing and shutdown.
use log::*;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    config::{CoordinatorConfig, PoolConfig},
    coordinator::{acquire_shared_state, SharedPool},
    driver::VmDriver,
    reaper::Reaper,
    Error, Result, VmId,
};

pub mod options;
pub mod repopulate;

pub use options::PoolOptions;
pub use repopulate::{Repopulator, RepopulatorHandle};

/// Current pool length, read under the lock.
pub(crate) async fn pool_len(shared: &SharedPool) -> Result<usize> {
    let mut guard = shared.lock().await?;
    let len = guard.len().await?;
    guard.release().await?;
    Ok(len)
}

/// Append a freshly created VM unless the pool reached `target` in the
/// meantime, in which case the VM is destroyed. Returns whether it was pooled.
pub(crate) async fn offer(
    shared: &SharedPool,
    driver: &VmDriver,
    target: usize,
    id: VmId,
) -> Result<bool> {
    match try_offer(shared, target, &id).await {
        Ok(Some(now)) => {
            info!("pool is now {now:?}");
            Ok(true)
        }
        Ok(None) => {
            info!("pool already at {target}, discarding {id}");
            driver.destroy(&id).await;
            Ok(false)
        }
        Err(e) => {
            error!("Fail to pool {id}: {e}");
            driver.destroy(&id).await;
            Err(e)
        }
    }
}

async fn try_offer(shared: &SharedPool, target: usize, id: &VmId) -> Result<Option<Vec<VmId>>> {
    let mut guard = shared.lock().await?;
    if guard.len().await? >= target {
        guard.release().await?;
        return Ok(None);
    }
    guard.push(id.clone()).await?;
    // The push only counts once the lock is released; if anything fails
    // before that the host withdraws it.
    let now = guard.list().await?;
    guard.release().await?;
    Ok(Some(now))
}

/// One server process's view of the shared warm pool.
pub struct WarmPool {
    shared: SharedPool,
    driver: VmDriver,
    options: PoolOptions,
    reaper: Reaper,
    repopulator: Mutex<Option<RepopulatorHandle>>,
    orphans: JoinHandle<()>,
}

/// Destroy what clients took from the pool and never confirmed. Only does
/// anything while this process hosts the pool.
fn spawn_orphan_reaper(shared: &SharedPool, driver: VmDriver) -> JoinHandle<()> {
    let orphans = shared.orphans();
    tokio::spawn(async move {
        while let Ok(id) = orphans.recv().await {
            warn!("destroying orphaned {id}");
            driver.destroy(&id).await;
        }
    })
}

impl WarmPool {
    /// Bootstrap from a config file's worth of settings, using ignite.
    pub async fn bootstrap(config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        let driver = VmDriver::ignite(config.spec(), config.driver());
        Self::bootstrap_with(driver, &config.coordinator(), PoolOptions::from_config(config)).await
    }

    /// Join (or host) the shared pool, warm it up to target and start the
    /// repopulation loop. The loop only fills the pool while this process
    /// hosts it.
    pub async fn bootstrap_with(
        driver: VmDriver,
        coordinator: &CoordinatorConfig,
        options: PoolOptions,
    ) -> Result<Self> {
        if options.target_size == 0 {
            return Err(Error::Config("pool target size must be at least 1".to_string()));
        }
        let shared = acquire_shared_state(coordinator).await?;
        let reaper = Reaper::spawn(driver.clone(), options.teardown_workers, options.teardown_queue);
        let orphans = spawn_orphan_reaper(&shared, driver.clone());
        let pool = Self {
            shared,
            driver,
            options,
            reaper,
            repopulator: Mutex::new(None),
            orphans,
        };

        pool.warm_up().await?;
        if pool.options.repopulate {
            pool.start_repopulating().await;
        }
        Ok(pool)
    }

    pub fn shared(&self) -> &SharedPool {
        &self.shared
    }

    pub fn driver(&self) -> &VmDriver {
        &self.driver
    }

    pub fn target_size(&self) -> usize {
        self.options.target_size
    }

    pub async fn len(&self) -> Result<usize> {
        pool_len(&self.shared).await
    }

    pub async fn list(&self) -> Result<Vec<VmId>> {
        let mut guard = self.shared.lock().await?;
        let ids = guard.list().await?;
        guard.release().await?;
        Ok(ids)
    }

    /// Create VMs until the pool is at target. Makes at most `target`
    /// attempts; failed creates are skipped, not retried.
    pub async fn warm_up(&self) -> Result<usize> {
        let target = self.options.target_size;
        let mut added = 0;
        for _ in 0..target {
            if self.len().await? >= target {
                break;
            }
            if let Some(id) = self.driver.create().await {
                if offer(&self.shared, &self.driver, target, id).await? {
                    added += 1;
                }
            }
        }
        info!("warm-up added {added} VMs, pool is now {:?}", self.list().await?);
        Ok(added)
    }

    pub fn repopulator(&self) -> Repopulator {
        Repopulator::new(
            self.shared.clone(),
            self.driver.clone(),
            self.options.target_size,
            self.options.repopulate_interval,
        )
    }

    /// Start the background loop unless it already runs.
    pub async fn start_repopulating(&self) {
        let mut slot = self.repopulator.lock().await;
        if slot.is_none() {
            *slot = Some(self.repopulator().spawn());
        }
    }

    /// Whether this process is the one keeping the pool at target.
    pub async fn is_repopulating(&self) -> bool {
        self.shared.is_host()
            && self
                .repopulator
                .lock()
                .await
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Take one warm VM out of the pool for good. Fails with
    /// [`Error::PoolExhausted`] right away if the pool is empty.
    pub async fn lease(&self) -> Result<Lease<'_>> {
        let mut guard = self.shared.lock().await?;
        let Some(id) = guard.pop().await? else {
            guard.release().await?;
            warn!("pool exhausted");
            return Err(Error::PoolExhausted);
        };
        // From here on the VM is ours; nothing may lose it.
        let lease = Lease {
            id,
            reaper: &self.reaper,
        };
        info!("popped {}", lease.id);
        // Unconfirmed pops are destroyed by the host, so a lease whose
        // release failed is given up (and torn down) here as well.
        let now = guard.list().await?;
        guard.release().await?;
        info!("pool is now {now:?}");
        Ok(lease)
    }

    /// Stop repopulating, destroy every VM still pooled and finish all
    /// queued teardowns. VMs leased by in-flight requests are left to them.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.repopulator.lock().await.take() {
            handle.stop().await;
            info!("Closed repopulation task");
        }

        let mut guard = self.shared.lock().await?;
        let drained = guard.drain().await?;
        let released = guard.release().await;
        for id in &drained {
            self.driver.destroy(id).await;
        }
        info!("destroyed {} pooled VMs", drained.len());

        info!("waiting for {} queued teardowns", self.reaper.pending());
        self.reaper.close().await;
        released
    }
}

impl Drop for WarmPool {
    fn drop(&mut self) {
        self.orphans.abort();
    }
}

/// Exclusive, one-time ownership of a VM taken from the pool. Dropping the
/// lease schedules the VM's destruction; it never goes back to the pool.
pub struct Lease<'a> {
    id: VmId,
    reaper: &'a Reaper,
}

impl Lease<'_> {
    pub fn id(&self) -> &VmId {
        &self.id
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.reaper.schedule(self.id.clone());
    }
}

impl std::fmt::Debug for Lease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}
