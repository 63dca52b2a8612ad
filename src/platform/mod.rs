//! The external VM platform, seen as a handful of commands that either
//! exit zero or do not.
use std::path::Path;

use async_trait::async_trait;

use crate::{config::Spec, Result, VmId};

pub mod command_builder;
pub mod ignite;
#[cfg(any(test, feature = "testing"))]
pub mod recording;

pub use ignite::Ignite;

/// Outcome of a platform command that could be run.
/// An `Err` from a [`Platform`] method means the command could not be run at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,

    /// Captured standard error, empty when it was streamed instead.
    pub stderr: String,
}

impl Invocation {
    pub fn ok() -> Self {
        Self {
            status: Some(0),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Short human readable status, e.g. `exit status: 1`.
    pub fn describe(&self) -> String {
        let status = match self.status {
            Some(code) => format!("exit status: {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            format!("{status}: {stderr}")
        }
    }
}

/// Operations the microVM platform offers. Implementations must be safe to
/// call concurrently for different VMs.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Create (but do not start) a VM named `id`.
    async fn create(&self, spec: &Spec, id: &VmId) -> Result<Invocation>;

    async fn start(&self, id: &VmId) -> Result<Invocation>;

    async fn stop(&self, id: &VmId) -> Result<Invocation>;

    async fn remove(&self, id: &VmId) -> Result<Invocation>;

    /// Run `command` inside the VM, streaming its combined output to the log.
    async fn exec(&self, id: &VmId, command: &str) -> Result<Invocation>;

    /// Copy `remote` out of the VM to `local` on the host.
    async fn copy_out(&self, id: &VmId, remote: &str, local: &Path) -> Result<Invocation>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_invocation() {
        assert!(Invocation::ok().success());
        assert_eq!(Invocation::ok().describe(), "exit status: 0");
        let failed = Invocation::failed(3, "no such vm\n");
        assert!(!failed.success());
        assert_eq!(failed.describe(), "exit status: 3: no such vm");
        let killed = Invocation {
            status: None,
            stderr: String::new(),
        };
        assert!(!killed.success());
        assert_eq!(killed.describe(), "terminated by signal");
    }
}
