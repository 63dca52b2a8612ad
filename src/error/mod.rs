use std::io;

use crate::VmId;

/// Errors in spoons
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configure: {0}")]
    Config(String),
    /// create or start of a microVM failed
    #[error("Provision: {0}")]
    Provision(String),
    /// No warm VM left to lease; the caller may retry later.
    #[error("No VM available; please retry")]
    PoolExhausted,
    /// The capture tool ran but did not produce an artifact.
    #[error("Capture on {vm} failed: {status}")]
    Capture { vm: VmId, status: String },
    /// The capture tool could not be invoked at all.
    #[error("Capture invocation: {0}")]
    CaptureInvocation(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Coordinator: {0}")]
    Coordinator(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("Fail to encode or decode json: {0}")]
    Json(#[from] serde_json::Error),
    /// Unexpected or invalid data encountered on the coordination socket.
    #[error("encountered unexpected or invalid data: {0}")]
    Protocol(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of an [`Error`] for whatever answers the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PoolExhausted,
    InvalidInput,
    CaptureFailed,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PoolExhausted => ErrorKind::PoolExhausted,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Capture { .. } | Error::CaptureInvocation(_) => ErrorKind::CaptureFailed,
            _ => ErrorKind::Internal,
        }
    }

    /// Only an exhausted pool is worth retrying as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PoolExhausted)
    }
}

/// Format an error message as a `Protocol` error
#[macro_export]
macro_rules! err_protocol {
    ($($fmt_args:tt)*) => {
        $crate::error::Error::Protocol(
            format!(
                "{} ({}:{})",
                // Note: the format string needs to be unmodified (e.g. by `concat!()`)
                // for implicit formatting arguments to work
                format_args!($($fmt_args)*),
                module_path!(),
                line!(),
            )
        )
    };
}
