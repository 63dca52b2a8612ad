use std::{future::Future, path::Path, process::Stdio};

use async_trait::async_trait;
use log::*;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::{command_builder::IgniteCommandBuilder, Invocation, Platform};
use crate::{
    config::{DriverConfig, Spec},
    Error, Result, VmId,
};

/// [`Platform`] backed by the `ignite` command line tool.
#[derive(Debug, Clone)]
pub struct Ignite {
    config: DriverConfig,
}

impl Ignite {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> IgniteCommandBuilder {
        IgniteCommandBuilder::default()
            .with_bin(self.config.ignite_bin.clone())
            .set_sudo(self.config.use_sudo)
    }

    /// Apply the configured timeout, if any, to one invocation.
    async fn bounded<F>(&self, what: String, fut: F) -> Result<Invocation>
    where
        F: Future<Output = Result<Invocation>>,
    {
        match self.config.command_timeout {
            None => fut.await,
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                warn!("{what} did not finish within {limit:?}");
                Error::Timeout(format!("{what} after {limit:?}"))
            })?,
        }
    }

    /// Run to completion, capturing stderr.
    async fn run(&self, builder: IgniteCommandBuilder) -> Result<Invocation> {
        let argv = builder.argv().join(" ");
        debug!("running {argv}");
        let mut cmd = builder.build();
        self.bounded(argv, async move {
            let output = cmd.output().await?;
            Ok(Invocation {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
        .await
    }

    /// Run to completion, forwarding stdout and stderr line by line to the log.
    async fn run_streaming(&self, id: &VmId, builder: IgniteCommandBuilder) -> Result<Invocation> {
        let argv = builder.argv().join(" ");
        debug!("running {argv}");
        let mut cmd = builder
            .with_stdout(Stdio::piped())
            .with_stderr(Stdio::piped())
            .build();
        self.bounded(argv, async move {
            let mut child = cmd.spawn()?;
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            tokio::join!(forward(id, stdout), forward(id, stderr));
            let status = child.wait().await?;
            Ok(Invocation {
                status: status.code(),
                stderr: String::new(),
            })
        })
        .await
    }
}

async fn forward<R: AsyncRead + Unpin>(id: &VmId, stream: Option<R>) {
    let Some(stream) = stream else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!("[{id}] {line}"),
            Ok(None) => break,
            Err(e) => {
                warn!("[{id}] fail to read output: {e}");
                break;
            }
        }
    }
}

#[async_trait]
impl Platform for Ignite {
    async fn create(&self, spec: &Spec, id: &VmId) -> Result<Invocation> {
        let cmd = self
            .command()
            .args(["create", spec.image.as_str(), "--name", id.as_str()])
            .args(["--cpus".to_string(), spec.cpus.to_string()])
            .args(["--memory".to_string(), format!("{}GB", spec.memory_gb)])
            .args(["--size".to_string(), format!("{}GB", spec.disk_gb)])
            .arg("--ssh");
        self.run(cmd).await
    }

    async fn start(&self, id: &VmId) -> Result<Invocation> {
        self.run(self.command().args(["start", id.as_str()])).await
    }

    async fn stop(&self, id: &VmId) -> Result<Invocation> {
        self.run(self.command().args(["stop", id.as_str()])).await
    }

    async fn remove(&self, id: &VmId) -> Result<Invocation> {
        self.run(self.command().args(["rm", id.as_str()])).await
    }

    async fn exec(&self, id: &VmId, command: &str) -> Result<Invocation> {
        let cmd = self.command().args(["exec", id.as_str(), command]);
        self.run_streaming(id, cmd).await
    }

    async fn copy_out(&self, id: &VmId, remote: &str, local: &Path) -> Result<Invocation> {
        let cmd = self
            .command()
            .arg("cp")
            .arg(format!("{id}:{remote}"))
            .arg(local.as_os_str());
        self.run(cmd).await
    }
}
