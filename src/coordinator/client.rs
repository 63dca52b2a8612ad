use std::{io, net::SocketAddr, time::Duration};

use log::*;
use tokio::{io::BufStream, net::TcpStream};

use super::protocol::{read_frame, write_frame, Request, Response, PROTOCOL_VERSION};
use crate::{err_protocol, Error, Result};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// An authenticated connection to the pool host.
#[derive(Debug)]
pub struct Connection {
    stream: BufStream<TcpStream>,
}

impl Connection {
    /// Connect and perform the hello handshake.
    pub async fn connect(endpoint: SocketAddr, secret: &str) -> Result<Self> {
        let stream = connect_with_retry(endpoint).await?;
        stream.set_nodelay(true)?;
        let mut conn = Self {
            stream: BufStream::new(stream),
        };
        let hello = Request::Hello {
            secret: secret.to_string(),
            version: PROTOCOL_VERSION,
            pid: std::process::id(),
        };
        match conn.call(&hello).await? {
            Response::Welcome { host_pid } => {
                debug!("joined shared pool on {endpoint} hosted by pid {host_pid}");
                Ok(conn)
            }
            other => Err(err_protocol!("expected welcome, got {other:?}")),
        }
    }

    /// Send one request and wait for its response. A refusal from the host is
    /// a `Coordinator` error and leaves the connection usable; anything else
    /// that fails means the connection is gone.
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        write_frame(&mut self.stream, request).await?;
        match read_frame::<_, Response>(&mut self.stream).await? {
            None => Err(err_protocol!("pool host closed the connection")),
            Some(Response::Error { message }) => Err(Error::Coordinator(message)),
            Some(response) => Ok(response),
        }
    }
}

async fn connect_with_retry(endpoint: SocketAddr) -> Result<TcpStream> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused && attempt < CONNECT_ATTEMPTS => {
                warn!("pool host on {endpoint} refused connection (attempt {attempt}), retrying");
                attempt += 1;
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => {
                error!("Fail to connect to pool host on {endpoint}: {e}");
                return Err(Error::Coordinator(format!("connecting {endpoint}: {e}")));
            }
        }
    }
}
