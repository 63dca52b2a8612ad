//! Shared pool coordinator.
//!
//! Every server process on the host calls [`acquire_shared_state`] with the
//! same loopback endpoint and secret. The first one to bind the endpoint
//! hosts the sequence of warm VM ids; the others find the address taken and
//! connect to it. Either way the caller gets a [`SharedPool`], and all of them
//! see one sequence behind one lock.
//!
//! If the hosting process goes away, the next process to notice binds the
//! free endpoint and hosts a new, empty sequence; the rest join it.
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::*;
use tokio::{
    net::TcpListener,
    sync::{Mutex, OwnedMutexGuard},
};

use crate::{config::CoordinatorConfig, err_protocol, Error, Result, VmId};

pub mod client;
pub mod host;
pub mod protocol;

use client::Connection;
use host::HostHandle;
use protocol::{Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// This process serves the sequence.
    Host,
    /// Another process serves it.
    Client,
}

/// This process's way to the sequence.
#[derive(Debug)]
struct Link {
    // None until connected, or after the connection was lost.
    conn: Option<Connection>,
    host: Option<HostHandle>,
}

#[derive(Debug)]
struct SharedInner {
    endpoint: SocketAddr,
    secret: String,
    hosting: AtomicBool,
    link: Arc<Mutex<Link>>,
    orphan_tx: async_channel::Sender<VmId>,
    orphan_rx: async_channel::Receiver<VmId>,
}

/// Handle on the process-shared pool sequence and its lock.
#[derive(Debug, Clone)]
pub struct SharedPool {
    inner: Arc<SharedInner>,
}

/// Serve the sequence on `addr` if the address is free. `None` means
/// another process already serves it.
async fn try_host(
    addr: SocketAddr,
    secret: &str,
    orphans: &async_channel::Sender<VmId>,
) -> Result<Option<HostHandle>> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(Some(host::spawn(listener, secret.to_string(), orphans.clone())?)),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(None),
        Err(e) => {
            error!("Fail to bind coordination endpoint {addr}: {e}");
            Err(Error::Coordinator(format!("binding {addr}: {e}")))
        }
    }
}

/// Try to host the shared pool on `config.address`, or join whoever already does.
/// Losing the race to bind is the normal client path, not an error.
pub async fn acquire_shared_state(config: &CoordinatorConfig) -> Result<SharedPool> {
    let addr = config.socket_addr()?;
    let (orphan_tx, orphan_rx) = async_channel::unbounded();
    let host = try_host(addr, &config.secret, &orphan_tx).await?;
    let endpoint = match &host {
        Some(host) => host.endpoint(),
        None => {
            info!("shared pool already hosted on {addr}, joining it");
            addr
        }
    };

    // The handshake also proves that whoever holds the port is a pool host.
    let conn = Connection::connect(endpoint, &config.secret).await?;
    Ok(SharedPool {
        inner: Arc::new(SharedInner {
            endpoint,
            secret: config.secret.clone(),
            hosting: AtomicBool::new(host.is_some()),
            link: Arc::new(Mutex::new(Link {
                conn: Some(conn),
                host,
            })),
            orphan_tx,
            orphan_rx,
        }),
    })
}

impl SharedPool {
    /// Current role. A client becomes host when it takes over from a host
    /// that went away; a host stays host.
    pub fn role(&self) -> Role {
        if self.is_host() {
            Role::Host
        } else {
            Role::Client
        }
    }

    pub fn is_host(&self) -> bool {
        self.inner.hosting.load(Ordering::SeqCst)
    }

    /// Address the pool is served on.
    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }

    /// Ids taken by clients that went away before releasing the lock. Only a
    /// hosting process ever receives any, and they are to be destroyed.
    pub fn orphans(&self) -> async_channel::Receiver<VmId> {
        self.inner.orphan_rx.clone()
    }

    /// Take the pool lock. Waits for tasks of this process first, then for
    /// other processes.
    ///
    /// A connection found dead is replaced once. Reconnecting runs the
    /// election again: if the host went away its port is free, and this
    /// process takes over with an empty sequence.
    pub async fn lock(&self) -> Result<PoolGuard> {
        let mut link = Arc::clone(&self.inner.link).lock_owned().await;
        let mut retried = false;
        loop {
            let fresh = link.conn.is_none();
            if fresh {
                self.reconnect(&mut link).await?;
            }
            let Some(conn) = link.conn.as_mut() else {
                return Err(Error::Coordinator("connection to pool host lost".to_string()));
            };
            match conn.call(&Request::Lock).await {
                Ok(Response::Locked) => {
                    return Ok(PoolGuard {
                        link,
                        released: false,
                    })
                }
                Ok(other) => {
                    link.conn.take();
                    return Err(err_protocol!("expected locked, got {other:?}"));
                }
                Err(e @ Error::Coordinator(_)) => return Err(e),
                Err(e) => {
                    link.conn.take();
                    if fresh || retried {
                        return Err(e);
                    }
                    warn!("lost connection to pool host: {e}");
                    retried = true;
                }
            }
        }
    }

    async fn reconnect(&self, link: &mut Link) -> Result<()> {
        let endpoint = self.inner.endpoint;
        if link.host.is_none() {
            if let Some(host) = try_host(endpoint, &self.inner.secret, &self.inner.orphan_tx).await? {
                warn!("pool host on {endpoint} went away, taking over with an empty pool");
                link.host = Some(host);
                self.inner.hosting.store(true, Ordering::SeqCst);
            }
        }
        info!("reconnecting to shared pool on {endpoint}");
        link.conn = Some(Connection::connect(endpoint, &self.inner.secret).await?);
        Ok(())
    }
}

/// The pool lock, held. Every sequence operation goes through it.
///
/// Call [`PoolGuard::release`] when done; changes count from then on. A guard
/// that is dropped instead closes its connection, and the host rolls back
/// what was pushed under it and releases the lock.
#[derive(Debug)]
pub struct PoolGuard {
    link: OwnedMutexGuard<Link>,
    released: bool,
}

impl PoolGuard {
    async fn call(&mut self, request: Request) -> Result<Response> {
        let conn = self
            .link
            .conn
            .as_mut()
            .ok_or_else(|| Error::Coordinator("connection to pool host lost".to_string()))?;
        match conn.call(&request).await {
            Err(e @ Error::Coordinator(_)) => Err(e),
            Err(e) => {
                // Unknown stream state; the host frees the lock once we hang up.
                self.link.conn.take();
                self.released = true;
                Err(e)
            }
            Ok(response) => Ok(response),
        }
    }

    pub async fn len(&mut self) -> Result<usize> {
        match self.call(Request::Len).await? {
            Response::Len { len } => Ok(len),
            other => Err(err_protocol!("expected len, got {other:?}")),
        }
    }

    pub async fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn list(&mut self) -> Result<Vec<VmId>> {
        match self.call(Request::List).await? {
            Response::List { ids } => Ok(ids),
            other => Err(err_protocol!("expected list, got {other:?}")),
        }
    }

    /// Append a warm VM. The host refuses ids already in the sequence.
    pub async fn push(&mut self, id: VmId) -> Result<()> {
        match self.call(Request::Push { id }).await? {
            Response::Pushed => Ok(()),
            other => Err(err_protocol!("expected pushed, got {other:?}")),
        }
    }

    /// Remove and return the last id, if any.
    pub async fn pop(&mut self) -> Result<Option<VmId>> {
        match self.call(Request::Pop).await? {
            Response::Popped { id } => Ok(id),
            other => Err(err_protocol!("expected popped, got {other:?}")),
        }
    }

    /// Remove and return every id.
    pub async fn drain(&mut self) -> Result<Vec<VmId>> {
        match self.call(Request::Drain).await? {
            Response::Drained { ids } => Ok(ids),
            other => Err(err_protocol!("expected drained, got {other:?}")),
        }
    }

    pub async fn release(mut self) -> Result<()> {
        let res = match self.call(Request::Unlock).await {
            Ok(Response::Unlocked) => Ok(()),
            Ok(other) => Err(err_protocol!("expected unlocked, got {other:?}")),
            Err(e) => Err(e),
        };
        // On failure `call` either dropped the connection already or the
        // host still thinks we hold the lock; in both cases hanging up frees it.
        if res.is_err() {
            self.link.conn.take();
        }
        self.released = true;
        res
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if !self.released {
            debug!("pool guard dropped while locked, closing its connection");
            self.link.conn.take();
        }
    }
}
