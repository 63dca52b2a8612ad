//! Lease a warm VM, run one capture on it, hand back the artifact and
//! throw the VM away.
use std::sync::Arc;

use log::*;
use url::Url;

use crate::{models::Artifact, pool::WarmPool, Error, Result};

/// Check that `raw` is an absolute http(s) url with a host.
pub fn parse_capture_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let url = Url::parse(raw).map_err(|e| Error::InvalidInput(format!("{raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => (),
        other => {
            return Err(Error::InvalidInput(format!(
                "{raw:?}: unsupported scheme {other}"
            )))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::InvalidInput(format!("{raw:?}: missing host")));
    }
    Ok(url)
}

#[derive(Clone)]
pub struct CaptureService {
    pool: Arc<WarmPool>,
}

impl CaptureService {
    pub fn new(pool: Arc<WarmPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<WarmPool> {
        &self.pool
    }

    /// Capture `url` on a VM of its own.
    ///
    /// Bad input is rejected before anything is leased. Once a VM is leased
    /// its teardown is scheduled exactly once, whatever the capture returns,
    /// and before the result reaches the caller.
    pub async fn capture(&self, url: &str) -> Result<Artifact> {
        let url = parse_capture_url(url)?;
        let lease = self.pool.lease().await?;
        let res = self.pool.driver().run_capture(lease.id(), &url).await;
        // schedules the teardown
        drop(lease);
        match &res {
            Ok(artifact) => info!("artifact ready at {}", artifact.path.display()),
            Err(e) => warn!("capture of {url} failed: {e}"),
        }
        res
    }
}
