//! The process that won the endpoint keeps the one shared sequence and
//! serves it to every client, itself included.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use log::*;
use tokio::{
    io::BufStream,
    net::{TcpListener, TcpStream},
    sync::{Mutex, OwnedMutexGuard},
    task::{JoinHandle, JoinSet},
};

use super::protocol::{read_frame, write_frame, Request, Response, PROTOCOL_VERSION};
use crate::{Error, Result, VmId};

type Sequence = Arc<Mutex<Vec<VmId>>>;

/// Owns the accept loop. Dropping it stops serving and disconnects every client.
#[derive(Debug)]
pub struct HostHandle {
    endpoint: SocketAddr,
    task: JoinHandle<()>,
}

impl HostHandle {
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start serving an empty sequence on an already bound listener. Ids taken
/// by clients that vanish before releasing the lock are sent to `orphans`.
pub fn spawn(
    listener: TcpListener,
    secret: String,
    orphans: async_channel::Sender<VmId>,
) -> Result<HostHandle> {
    let endpoint = listener.local_addr()?;
    let sequence: Sequence = Arc::new(Mutex::new(Vec::new()));
    let secret = Arc::new(secret);
    info!("hosting shared pool on {endpoint}");
    let task = tokio::spawn(accept_loop(listener, secret, sequence, orphans));
    Ok(HostHandle { endpoint, task })
}

async fn accept_loop(
    listener: TcpListener,
    secret: Arc<String>,
    sequence: Sequence,
    orphans: async_channel::Sender<VmId>,
) {
    // Aborting this task drops the set, which aborts every connection.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("pool client connected from {peer}");
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&secret),
                        Arc::clone(&sequence),
                        orphans.clone(),
                    ));
                }
                Err(e) => {
                    error!("Fail to accept pool client: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("pool connection task panicked: {e}");
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    secret: Arc<String>,
    sequence: Sequence,
    orphans: async_channel::Sender<VmId>,
) {
    match serve(stream, &secret, sequence, &orphans).await {
        Ok(()) => debug!("pool client {peer} disconnected"),
        Err(e) => warn!("pool client {peer} dropped: {e}"),
    }
}

async fn serve(
    stream: TcpStream,
    secret: &str,
    sequence: Sequence,
    orphans: &async_channel::Sender<VmId>,
) -> Result<()> {
    let mut stream = BufStream::new(stream);
    if !handshake(&mut stream, secret).await? {
        return Ok(());
    }

    // Held while this client owns the lock; dropped (released) on unlock or disconnect.
    let mut held: Option<OwnedMutexGuard<Vec<VmId>>> = None;
    let mut journal = Journal::default();
    let res = serve_requests(&mut stream, &sequence, &mut held, &mut journal).await;
    if let Some(mut ids) = held.take() {
        warn!("pool client went away holding the lock, rolling back {journal:?}");
        journal.abandon(&mut ids, orphans);
    }
    res
}

/// Check the hello frame. `Ok(false)` if the client hung up before sending one.
async fn handshake(stream: &mut BufStream<TcpStream>, secret: &str) -> Result<bool> {
    match read_frame::<_, Request>(stream).await? {
        None => Ok(false),
        Some(Request::Hello {
            secret: offered,
            version,
            pid,
        }) => {
            if version != PROTOCOL_VERSION {
                write_frame(stream, &Response::error("unsupported protocol version")).await?;
                return Err(Error::Coordinator(format!(
                    "client {pid} speaks protocol version {version}"
                )));
            }
            if offered != secret {
                write_frame(stream, &Response::error("bad secret")).await?;
                return Err(Error::Coordinator(format!("client {pid} offered a bad secret")));
            }
            debug!("pool client {pid} authenticated");
            let welcome = Response::Welcome {
                host_pid: std::process::id(),
            };
            write_frame(stream, &welcome).await?;
            Ok(true)
        }
        Some(other) => {
            write_frame(stream, &Response::error("expected hello")).await?;
            Err(Error::Coordinator(format!("handshake expected, got {other:?}")))
        }
    }
}

async fn serve_requests(
    stream: &mut BufStream<TcpStream>,
    sequence: &Sequence,
    held: &mut Option<OwnedMutexGuard<Vec<VmId>>>,
    journal: &mut Journal,
) -> Result<()> {
    while let Some(request) = read_frame::<_, Request>(stream).await? {
        let response = match request {
            Request::Hello { .. } => Response::error("already authenticated"),
            Request::Lock => {
                if held.is_some() {
                    Response::error("lock already held by this connection")
                } else {
                    *held = Some(Arc::clone(sequence).lock_owned().await);
                    *journal = Journal::default();
                    Response::Locked
                }
            }
            // committing happens here, before the reply is written
            Request::Unlock => match held.take() {
                Some(_) => {
                    *journal = Journal::default();
                    Response::Unlocked
                }
                None => Response::error("lock not held"),
            },
            other => match held.as_deref_mut() {
                Some(ids) => apply(ids, other, journal),
                None => Response::error("lock not held"),
            },
        };
        write_frame(stream, &response).await?;
    }
    Ok(())
}

/// Changes made by the current lock holder since it took the lock.
#[derive(Debug, Default)]
struct Journal {
    pushed: Vec<VmId>,
    taken: Vec<VmId>,
}

impl Journal {
    /// The holder never released the lock, so it may not know the outcome of
    /// its last request. Its pushes are withdrawn; what it took cannot be put
    /// back, since it may be in use, and is handed over for destruction.
    fn abandon(self, ids: &mut Vec<VmId>, orphans: &async_channel::Sender<VmId>) {
        ids.retain(|id| !self.pushed.contains(id));
        for id in self.taken {
            warn!("{id} was taken by a client that went away");
            if let Err(e) = orphans.try_send(id) {
                error!("Fail to hand over orphaned {}: no one destroys it", e.into_inner());
            }
        }
    }
}

/// Apply one operation to the sequence. The caller holds the lock.
fn apply(ids: &mut Vec<VmId>, request: Request, journal: &mut Journal) -> Response {
    match request {
        Request::Len => Response::Len { len: ids.len() },
        Request::List => Response::List { ids: ids.clone() },
        Request::Push { id } => {
            if ids.contains(&id) {
                Response::error(format!("{id} is already pooled"))
            } else {
                ids.push(id.clone());
                journal.pushed.push(id);
                Response::Pushed
            }
        }
        Request::Pop => {
            let id = ids.pop();
            journal.taken.extend(id.clone());
            Response::Popped { id }
        }
        Request::Drain => {
            let drained = std::mem::take(ids);
            journal.taken.extend(drained.iter().cloned());
            Response::Drained { ids: drained }
        }
        Request::Hello { .. } | Request::Lock | Request::Unlock => {
            Response::error("not a sequence operation")
        }
    }
}
