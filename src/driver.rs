//! VM lifecycle driver: create, destroy and capture on a single microVM.
use std::{path::PathBuf, sync::Arc};

use log::*;
use url::Url;

use crate::{
    config::{DriverConfig, Spec},
    models::Artifact,
    platform::{Ignite, Platform},
    utils::{sanitize_filename, shell_quote},
    Error, Result, VmId,
};

const ARTIFACT_EXTENSION: &str = "wacz";

#[derive(Clone)]
pub struct VmDriver {
    platform: Arc<dyn Platform>,
    spec: Spec,
    config: DriverConfig,
}

impl std::fmt::Debug for VmDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmDriver")
            .field("spec", &self.spec)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VmDriver {
    /// Driver talking to the real `ignite` tool.
    pub fn ignite(spec: Spec, config: DriverConfig) -> Self {
        let platform = Arc::new(Ignite::new(config.clone()));
        Self::with_platform(spec, config, platform)
    }

    pub fn with_platform(spec: Spec, config: DriverConfig, platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            spec,
            config,
        }
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn dry_run(&self) -> bool {
        self.spec.dry_run
    }

    /// Create and start a fresh VM. Returns `None` if either step fails; the
    /// failure is logged and not retried here.
    pub async fn create(&self) -> Option<VmId> {
        let id = VmId::mint();
        if self.dry_run() {
            info!("added VM {id} (dry run)");
            return Some(id);
        }

        match self.provision(&id).await {
            Ok(()) => {
                info!("added VM {id}");
                Some(id)
            }
            Err(e) => {
                warn!("Couldn't create VM: {e}");
                None
            }
        }
    }

    /// Create then start `id`. A VM that was created but did not start is
    /// removed again.
    async fn provision(&self, id: &VmId) -> Result<()> {
        let created = self
            .platform
            .create(&self.spec, id)
            .await
            .map_err(|e| Error::Provision(format!("create {id}: {e}")))?;
        if !created.success() {
            return Err(Error::Provision(format!(
                "create {id}: {}",
                created.describe()
            )));
        }

        let started = match self.platform.start(id).await {
            Ok(res) if res.success() => Ok(()),
            Ok(res) => Err(Error::Provision(format!("start {id}: {}", res.describe()))),
            Err(e) => Err(Error::Provision(format!("start {id}: {e}"))),
        };
        if started.is_err() {
            self.destroy(id).await;
        }
        started
    }

    /// Stop and remove a VM. Never fails; problems are only logged.
    pub async fn destroy(&self, id: &VmId) {
        info!("shutting down {id}");
        if self.dry_run() {
            return;
        }

        match self.platform.stop(id).await {
            Ok(res) if res.success() => (),
            Ok(res) => error!("Fail to stop VM {id}: {}", res.describe()),
            Err(e) => error!("Fail to stop VM {id}: {e}"),
        }
        match self.platform.remove(id).await {
            Ok(res) if res.success() => debug!("removed VM {id}"),
            Ok(res) => error!("Fail to remove VM {id}: {}", res.describe()),
            Err(e) => error!("Fail to remove VM {id}: {e}"),
        }
    }

    /// Run the capture tool against `url` inside `id` and pull the archive
    /// out to [`VmDriver::artifact_path`]. Tearing the VM down afterwards is
    /// the caller's job.
    pub async fn run_capture(&self, id: &VmId, url: &Url) -> Result<Artifact> {
        let artifact = Artifact {
            vm: id.clone(),
            path: self.artifact_path(id),
            download_name: download_name(url, id),
        };
        if self.dry_run() {
            info!("capture of {url} on {id} skipped (dry run)");
            return Ok(artifact);
        }

        info!("capturing {url} on {id}");
        let res = self
            .platform
            .exec(id, &capture_command(url))
            .await
            .map_err(|e| {
                warn!("Couldn't capture: {e}");
                Error::CaptureInvocation(format!("exec on {id}: {e}"))
            })?;
        if !res.success() {
            warn!("capture of {url} on {id} failed: {}", res.describe());
            return Err(Error::Capture {
                vm: id.clone(),
                status: res.describe(),
            });
        }

        let res = self
            .platform
            .copy_out(id, &self.config.remote_artifact_path, &artifact.path)
            .await
            .map_err(|e| {
                warn!("Couldn't copy artifact out of {id}: {e}");
                Error::CaptureInvocation(format!("copy out of {id}: {e}"))
            })?;
        if !res.success() {
            warn!("copying artifact out of {id} failed: {}", res.describe());
            return Err(Error::Capture {
                vm: id.clone(),
                status: res.describe(),
            });
        }

        info!("captured {url} on {id} to {}", artifact.path.display());
        Ok(artifact)
    }

    pub fn artifact_path(&self, id: &VmId) -> PathBuf {
        self.config
            .artifact_dir
            .join(format!("{id}.{ARTIFACT_EXTENSION}"))
    }
}

/// Command run inside the VM: the capture tool under a virtual display.
pub fn capture_command(url: &Url) -> String {
    format!(
        "xvfb-run --auto-servernum -- scoop {} --headless false",
        shell_quote(url.as_str())
    )
}

/// File name offered to whoever downloads the artifact.
pub fn download_name(url: &Url, id: &VmId) -> String {
    format!(
        "{}-{id}.{ARTIFACT_EXTENSION}",
        sanitize_filename(url.as_str())
    )
}
