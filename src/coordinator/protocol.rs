//! Wire format between pool clients and the pool host: one JSON object per
//! line over a loopback TCP stream.
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{err_protocol, Result, VmId};

pub const PROTOCOL_VERSION: u32 = 1;

/// Longest accepted frame, newline included.
pub const MAX_FRAME_LEN: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// First frame of every connection.
    Hello {
        secret: String,
        version: u32,
        pid: u32,
    },
    Lock,
    Unlock,
    Len,
    List,
    Push { id: VmId },
    Pop,
    Drain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Welcome { host_pid: u32 },
    Locked,
    Unlocked,
    Len { len: usize },
    List { ids: Vec<VmId> },
    Pushed,
    Popped { id: Option<VmId> },
    Drained { ids: Vec<VmId> },
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

pub async fn write_frame<W, T>(w: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(frame)?;
    buf.push(b'\n');
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_frame<R, T>(r: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let read = r.take(MAX_FRAME_LEN).read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(if read as u64 >= MAX_FRAME_LEN {
            err_protocol!("frame longer than {MAX_FRAME_LEN} bytes")
        } else {
            err_protocol!("stream closed in the middle of a frame")
        });
    }
    let frame = serde_json::from_str(line.trim_end())
        .map_err(|e| err_protocol!("undecodable frame: {e}"))?;
    Ok(Some(frame))
}
