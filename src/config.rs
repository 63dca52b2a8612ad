use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{handle_entry_default, Error, Result};

pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_IMAGE: &str = "registry.lil.tools/harvardlil/spoon:0.1.2";
pub const DEFAULT_CPUS: u32 = 2;
pub const DEFAULT_MEMORY_GB: u32 = 1;
pub const DEFAULT_DISK_GB: u32 = 6;

pub const DEFAULT_COORDINATOR_ADDRESS: &str = "127.0.0.1:35791";
pub const DEFAULT_COORDINATOR_SECRET: &str = "secret";

pub const DEFAULT_IGNITE_BIN: &str = "ignite";
pub const DEFAULT_ARTIFACT_DIR: &str = "/tmp";
pub const DEFAULT_REMOTE_ARTIFACT_PATH: &str = "/root/archive.wacz";

pub const DEFAULT_REPOPULATE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_TEARDOWN_WORKERS: usize = 2;
pub const DEFAULT_TEARDOWN_QUEUE: usize = 64;

/// Shape of every VM in the pool. Fixed for the lifetime of a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Spec {
    /// OCI image the VM boots from.
    pub image: String,

    /// Number of vCPUs.
    pub cpus: u32,

    /// RAM in GB.
    pub memory_gb: u32,

    /// Disk size in GB.
    pub disk_gb: u32,

    /// dry_run keeps every control path but never touches the platform.
    pub dry_run: bool,
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            cpus: DEFAULT_CPUS,
            memory_gb: DEFAULT_MEMORY_GB,
            disk_gb: DEFAULT_DISK_GB,
            dry_run: false,
        }
    }
}

impl Spec {
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            log::error!("Spec::validate: empty image");
            return Err(Error::Config("image must be specified".to_string()));
        }
        if self.cpus == 0 || self.memory_gb == 0 || self.disk_gb == 0 {
            log::error!("Spec::validate: zero sized resource in {self:?}");
            return Err(Error::Config(
                "cpus, memory_gb and disk_gb must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the process-shared pool lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CoordinatorConfig {
    /// Loopback `host:port` the pool host listens on.
    pub address: String,

    /// Shared secret every client presents in its handshake.
    pub secret: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_COORDINATOR_ADDRESS.to_string(),
            secret: DEFAULT_COORDINATOR_SECRET.to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr: SocketAddr = self
            .address
            .parse()
            .map_err(|e| Error::Config(format!("bad coordinator address {}: {e}", self.address)))?;
        if !addr.ip().is_loopback() {
            return Err(Error::Config(format!(
                "coordinator address {addr} is not a loopback address"
            )));
        }
        Ok(addr)
    }

    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        if self.secret.is_empty() {
            return Err(Error::Config("coordinator secret must not be empty".to_string()));
        }
        Ok(())
    }
}

/// How the platform and the capture tool are invoked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DriverConfig {
    /// ignite binary, looked up in `PATH` unless absolute.
    pub ignite_bin: String,

    /// Prefix every platform command with `sudo`.
    pub use_sudo: bool,

    /// Directory the artifacts are copied into.
    pub artifact_dir: PathBuf,

    /// Where the capture tool leaves its archive inside the VM.
    pub remote_artifact_path: String,

    /// Upper bound for any single platform command. `None` waits forever.
    pub command_timeout: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            ignite_bin: DEFAULT_IGNITE_BIN.to_string(),
            use_sudo: !nix::unistd::geteuid().is_root(),
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            remote_artifact_path: DEFAULT_REMOTE_ARTIFACT_PATH.to_string(),
            command_timeout: None,
        }
    }
}

/// Everything a server process needs, as read from the config file.
/// Every entry is optional and falls back to the defaults above.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Target number of warm VMs.
    pub pool_size: Option<usize>,

    pub image: Option<String>,
    pub cpus: Option<u32>,
    pub memory_gb: Option<u32>,
    pub disk_gb: Option<u32>,
    pub dry_run: Option<bool>,

    pub coordinator_address: Option<String>,
    pub coordinator_secret: Option<String>,

    pub ignite_bin: Option<String>,
    pub use_sudo: Option<bool>,
    pub artifact_dir: Option<String>,
    pub remote_artifact_path: Option<String>,

    /// Timeout applied to each platform command, in seconds.
    pub command_timeout_secs: Option<u64>,

    /// Tick of the repopulation loop, in milliseconds.
    pub repopulate_interval_ms: Option<u64>,

    /// Number of background teardown workers.
    pub teardown_workers: Option<usize>,

    /// Capacity of the teardown queue.
    pub teardown_queue: Option<usize>,
}

impl PoolConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            log::error!("Fail to read config {}: {e}", path.display());
            Error::Config(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn pool_size(&self) -> usize {
        handle_entry_default(&self.pool_size, DEFAULT_POOL_SIZE)
    }

    pub fn spec(&self) -> Spec {
        let default = Spec::default();
        Spec {
            image: handle_entry_default(&self.image, default.image),
            cpus: handle_entry_default(&self.cpus, default.cpus),
            memory_gb: handle_entry_default(&self.memory_gb, default.memory_gb),
            disk_gb: handle_entry_default(&self.disk_gb, default.disk_gb),
            dry_run: handle_entry_default(&self.dry_run, default.dry_run),
        }
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        let default = CoordinatorConfig::default();
        CoordinatorConfig {
            address: handle_entry_default(&self.coordinator_address, default.address),
            secret: handle_entry_default(&self.coordinator_secret, default.secret),
        }
    }

    pub fn driver(&self) -> DriverConfig {
        let default = DriverConfig::default();
        DriverConfig {
            ignite_bin: handle_entry_default(&self.ignite_bin, default.ignite_bin),
            use_sudo: handle_entry_default(&self.use_sudo, default.use_sudo),
            artifact_dir: self
                .artifact_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or(default.artifact_dir),
            remote_artifact_path: handle_entry_default(
                &self.remote_artifact_path,
                default.remote_artifact_path,
            ),
            command_timeout: self.command_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn repopulate_interval(&self) -> Duration {
        Duration::from_millis(handle_entry_default(
            &self.repopulate_interval_ms,
            DEFAULT_REPOPULATE_INTERVAL_MS,
        ))
    }

    pub fn teardown_workers(&self) -> usize {
        handle_entry_default(&self.teardown_workers, DEFAULT_TEARDOWN_WORKERS)
    }

    pub fn teardown_queue(&self) -> usize {
        handle_entry_default(&self.teardown_queue, DEFAULT_TEARDOWN_QUEUE)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size() == 0 {
            log::error!("PoolConfig::validate: pool_size is zero");
            return Err(Error::Config("pool_size must be at least 1".to_string()));
        }
        if self.repopulate_interval_ms == Some(0) {
            return Err(Error::Config(
                "repopulate_interval_ms must be positive".to_string(),
            ));
        }
        if self.teardown_workers() == 0 || self.teardown_queue() == 0 {
            return Err(Error::Config(
                "teardown_workers and teardown_queue must be positive".to_string(),
            ));
        }
        if self.command_timeout_secs == Some(0) {
            return Err(Error::Config(
                "command_timeout_secs must be positive when set".to_string(),
            ));
        }
        self.spec().validate()?;
        self.coordinator().validate()?;
        Ok(())
    }
}
