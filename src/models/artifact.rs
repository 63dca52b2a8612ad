use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::vm::VmId;

/// Output of one finished capture job, pulled out of the VM that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    /// VM the capture ran in. It is already scheduled for teardown.
    pub vm: VmId,

    /// Local path of the archive, `<artifact_dir>/<vm>.wacz`.
    pub path: PathBuf,

    /// File name to offer on download, derived from the captured url.
    pub download_name: String,
}
