//! In-memory [`Platform`] that records every call instead of touching
//! real infrastructure. Used by the test suites.
use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{Invocation, Platform};
use crate::{config::Spec, Error, Result, VmId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(VmId),
    Start(VmId),
    Stop(VmId),
    Remove(VmId),
    Exec(VmId, String),
    CopyOut(VmId, String, PathBuf),
}

/// What a recorded operation answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Succeed,
    /// Exit with this non-zero code.
    Fail(i32),
    /// Fail to run the command at all.
    Error,
}

#[derive(Debug, Default)]
pub struct RecordingPlatform {
    calls: Mutex<Vec<Call>>,
    create: Mutex<Behavior>,
    start: Mutex<Behavior>,
    exec: Mutex<Behavior>,
    copy_out: Mutex<Behavior>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_create(&self, behavior: Behavior) {
        *locked(&self.create) = behavior;
    }

    pub fn set_start(&self, behavior: Behavior) {
        *locked(&self.start) = behavior;
    }

    pub fn set_exec(&self, behavior: Behavior) {
        *locked(&self.exec) = behavior;
    }

    pub fn set_copy_out(&self, behavior: Behavior) {
        *locked(&self.copy_out) = behavior;
    }

    pub fn calls(&self) -> Vec<Call> {
        locked(&self.calls).clone()
    }

    /// VMs that saw a `remove`, in call order.
    pub fn removed(&self) -> Vec<VmId> {
        locked(&self.calls)
            .iter()
            .filter_map(|c| match c {
                Call::Remove(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call, behavior: Behavior) -> Result<Invocation> {
        locked(&self.calls).push(call);
        match behavior {
            Behavior::Succeed => Ok(Invocation::ok()),
            Behavior::Fail(code) => Ok(Invocation::failed(code, "injected failure")),
            Behavior::Error => Err(Error::Io(std::io::Error::other("injected failure"))),
        }
    }
}

#[async_trait]
impl Platform for RecordingPlatform {
    async fn create(&self, _spec: &Spec, id: &VmId) -> Result<Invocation> {
        let behavior = *locked(&self.create);
        self.record(Call::Create(id.clone()), behavior)
    }

    async fn start(&self, id: &VmId) -> Result<Invocation> {
        let behavior = *locked(&self.start);
        self.record(Call::Start(id.clone()), behavior)
    }

    async fn stop(&self, id: &VmId) -> Result<Invocation> {
        self.record(Call::Stop(id.clone()), Behavior::Succeed)
    }

    async fn remove(&self, id: &VmId) -> Result<Invocation> {
        self.record(Call::Remove(id.clone()), Behavior::Succeed)
    }

    async fn exec(&self, id: &VmId, command: &str) -> Result<Invocation> {
        let behavior = *locked(&self.exec);
        self.record(Call::Exec(id.clone(), command.to_string()), behavior)
    }

    async fn copy_out(&self, id: &VmId, remote: &str, local: &Path) -> Result<Invocation> {
        let behavior = *locked(&self.copy_out);
        self.record(
            Call::CopyOut(id.clone(), remote.to_string(), local.to_path_buf()),
            behavior,
        )
    }
}
