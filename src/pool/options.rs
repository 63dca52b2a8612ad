use std::time::Duration;

use crate::config::{
    PoolConfig, DEFAULT_POOL_SIZE, DEFAULT_REPOPULATE_INTERVAL_MS, DEFAULT_TEARDOWN_QUEUE,
    DEFAULT_TEARDOWN_WORKERS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub(super) target_size: usize,
    pub(super) repopulate_interval: Duration,
    pub(super) teardown_workers: usize,
    pub(super) teardown_queue: usize,
    pub(super) repopulate: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self {
            target_size: DEFAULT_POOL_SIZE,
            repopulate_interval: Duration::from_millis(DEFAULT_REPOPULATE_INTERVAL_MS),
            teardown_workers: DEFAULT_TEARDOWN_WORKERS,
            teardown_queue: DEFAULT_TEARDOWN_QUEUE,
            repopulate: true,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new()
            .target_size(config.pool_size())
            .repopulate_interval(config.repopulate_interval())
            .teardown_workers(config.teardown_workers())
            .teardown_queue(config.teardown_queue())
    }

    /// Number of warm VMs the pool is kept at.
    pub fn target_size(mut self, size: usize) -> Self {
        self.target_size = size;
        self
    }

    /// Pause between two repopulation ticks.
    pub fn repopulate_interval(mut self, interval: Duration) -> Self {
        self.repopulate_interval = interval;
        self
    }

    /// Whether the hosting process runs the repopulation loop. On by default.
    pub fn repopulate(mut self, enabled: bool) -> Self {
        self.repopulate = enabled;
        self
    }

    pub fn teardown_workers(mut self, workers: usize) -> Self {
        self.teardown_workers = workers;
        self
    }

    pub fn teardown_queue(mut self, capacity: usize) -> Self {
        self.teardown_queue = capacity;
        self
    }
}
