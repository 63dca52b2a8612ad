#![allow(dead_code)]
use std::{path::PathBuf, sync::Arc};

use spoons::{
    config::{CoordinatorConfig, DriverConfig, Spec},
    platform::recording::RecordingPlatform,
    VmDriver,
};

pub const SECRET: &str = "test-secret";

pub fn init() {
    spoons::utils::init();
}

/// Host a fresh pool on an ephemeral loopback port.
pub fn fresh_coordinator() -> CoordinatorConfig {
    CoordinatorConfig {
        address: "127.0.0.1:0".to_string(),
        secret: SECRET.to_string(),
    }
}

/// Join the pool served on `endpoint`.
pub fn join(endpoint: std::net::SocketAddr) -> CoordinatorConfig {
    CoordinatorConfig {
        address: endpoint.to_string(),
        secret: SECRET.to_string(),
    }
}

pub fn driver(dry_run: bool) -> (VmDriver, Arc<RecordingPlatform>) {
    let platform = Arc::new(RecordingPlatform::new());
    let spec = Spec {
        dry_run,
        ..Default::default()
    };
    let config = DriverConfig {
        use_sudo: false,
        artifact_dir: PathBuf::from("/tmp/spoons-test"),
        ..Default::default()
    };
    (
        VmDriver::with_platform(spec, config, platform.clone()),
        platform,
    )
}
