//! A warm pool of disposable microVMs, shared by every server process on
//! the host. Each VM is leased exactly once to run a single web capture and
//! is destroyed afterwards.
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod models;
pub mod platform;
pub mod pool;
pub mod reaper;
pub mod utils;

pub use crate::capture::CaptureService;
pub use crate::coordinator::{acquire_shared_state, SharedPool};
pub use crate::driver::VmDriver;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::models::{Artifact, VmId};
pub use crate::pool::{Lease, PoolOptions, WarmPool};

#[doc(hidden)]
pub(crate) fn handle_entry_default<T: Clone>(entry: &Option<T>, default: T) -> T {
    entry.clone().unwrap_or(default)
}
