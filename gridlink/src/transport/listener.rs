//! # Transport Listener
//!
//! Binds the service endpoint and every network endpoint, then runs one
//! accept loop per socket. Each accepted connection gets its own task that
//! performs the TLS handshake (when transport is `tls`), the hello
//! exchange, and answers heartbeats until the peer leaves or goes quiet.
//!
//! A failed handshake only costs that connection: it is logged, counted in
//! [`ListenerStats`], and dropped. The accept loops keep running.
//!
//! Binding is all-or-nothing. If any endpoint fails, sockets bound so far
//! are released before the error is returned.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::wire::{Connection, LocalIdentity, PeerHello, WireError, WireMessage};
use super::{AsyncStream, Endpoint, Transport};
use crate::certs::{self, CertBundle};
use crate::config;

/// Pause after a failed `accept()` (EMFILE and friends) before retrying.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BindError {
    #[error("address {endpoint} already in use")]
    AddressInUse { endpoint: Endpoint },

    #[error("permission denied binding {endpoint}")]
    PermissionDenied { endpoint: Endpoint },

    #[error("invalid TLS configuration: {0}")]
    TlsHandshakeConfigInvalid(String),

    #[error("failed to bind {endpoint}: {source}")]
    Io {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },
}

impl BindError {
    fn from_io(endpoint: &Endpoint, e: std::io::Error) -> Self {
        let endpoint = endpoint.clone();
        match e.kind() {
            std::io::ErrorKind::AddrInUse => Self::AddressInUse { endpoint },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { endpoint },
            _ => Self::Io {
                endpoint,
                source: e,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Bound endpoints and counters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    Service,
    Network,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoundEndpoint {
    pub role: EndpointRole,
    /// The endpoint as configured (port may be 0).
    pub configured: Endpoint,
    /// The address actually bound.
    pub local_addr: SocketAddr,
}

/// Live counters shared by every accept loop and connection task.
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    handshake_failures: AtomicU64,
    active: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStatsSnapshot {
    pub accepted: u64,
    /// TLS or hello handshakes that did not complete.
    pub handshake_failures: u64,
    pub active: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

/// Decrements `active` when a connection task ends, however it ends.
struct ActiveGuard(Arc<ListenerStats>);

impl ActiveGuard {
    fn enter(stats: &Arc<ListenerStats>) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(stats))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Inbound session parameters; `bind` turns them into running sockets.
#[derive(Debug, Clone)]
pub struct TransportListener {
    identity: LocalIdentity,
    heartbeat: Duration,
    handshake_timeout: Duration,
}

struct InboundContext {
    identity: LocalIdentity,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    /// Silence longer than this drops the session.
    idle_limit: Duration,
    stats: Arc<ListenerStats>,
}

impl TransportListener {
    pub fn new(identity: LocalIdentity, heartbeat: Duration, handshake_timeout: Duration) -> Self {
        Self {
            identity,
            heartbeat,
            handshake_timeout,
        }
    }

    /// Binds `service` and every `network` endpoint and starts serving.
    ///
    /// With `tls`, `certs` must be present; its server config is built
    /// before any socket is opened.
    pub async fn bind(
        self,
        service: &Endpoint,
        network: &[Endpoint],
        transport: Transport,
        certs: Option<&CertBundle>,
    ) -> Result<ListenerHandle, BindError> {
        let tls = match (transport, certs) {
            (Transport::Raw, _) => None,
            (Transport::Tls, None) => {
                return Err(BindError::TlsHandshakeConfigInvalid(
                    "tls transport requires a certificate bundle".to_string(),
                ))
            }
            (Transport::Tls, Some(bundle)) => {
                let server = certs::server_config(bundle)
                    .map_err(|e| BindError::TlsHandshakeConfigInvalid(e.to_string()))?;
                Some(TlsAcceptor::from(server))
            }
        };

        let targets = std::iter::once((EndpointRole::Service, service))
            .chain(network.iter().map(|e| (EndpointRole::Network, e)));

        let mut sockets = Vec::new();
        for (role, endpoint) in targets {
            let socket = TcpListener::bind(endpoint.socket_tuple())
                .await
                .map_err(|e| BindError::from_io(endpoint, e))?;
            let local_addr = socket
                .local_addr()
                .map_err(|e| BindError::from_io(endpoint, e))?;
            info!(role = ?role, endpoint = %endpoint, %local_addr, transport = %transport, "listener bound");
            sockets.push((
                BoundEndpoint {
                    role,
                    configured: endpoint.clone(),
                    local_addr,
                },
                socket,
            ));
        }

        let stats = Arc::new(ListenerStats::default());
        let context = Arc::new(InboundContext {
            identity: self.identity,
            tls,
            handshake_timeout: self.handshake_timeout,
            idle_limit: self.heartbeat * config::INBOUND_MISSED_HEARTBEATS,
            stats: Arc::clone(&stats),
        });
        let (shutdown_tx, _) = watch::channel(false);

        let mut bound = Vec::with_capacity(sockets.len());
        let mut tasks = Vec::with_capacity(sockets.len());
        for (endpoint, socket) in sockets {
            tasks.push(tokio::spawn(accept_loop(
                socket,
                endpoint.local_addr,
                Arc::clone(&context),
                shutdown_tx.subscribe(),
            )));
            bound.push(endpoint);
        }

        Ok(ListenerHandle {
            bound,
            stats,
            shutdown: shutdown_tx,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }
}

/// Owner of the bound sockets. Dropping the handle also stops the accept
/// loops, but without waiting for them.
pub struct ListenerHandle {
    bound: Vec<BoundEndpoint>,
    stats: Arc<ListenerStats>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ListenerHandle {
    /// Service endpoint first, then network endpoints in configured order.
    pub fn bound(&self) -> &[BoundEndpoint] {
        &self.bound
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bound.iter().map(|b| b.local_addr).collect()
    }

    pub fn stats(&self) -> ListenerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops accepting, ends inbound sessions, and releases every socket.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "accept loop ended abnormally");
            }
        }
        info!(endpoints = self.bound.len(), "listener closed");
    }
}

async fn accept_loop(
    socket: TcpListener,
    local_addr: SocketAddr,
    context: Arc<InboundContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            accepted = socket.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    context.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    debug!(%local_addr, %peer_addr, "inbound connection");
                    sessions.spawn(serve_inbound(
                        stream,
                        peer_addr,
                        Arc::clone(&context),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(%local_addr, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
        }
    }
    drop(socket);
    while sessions.join_next().await.is_some() {}
    debug!(%local_addr, "accept loop stopped");
}

async fn serve_inbound(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<InboundContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _active = ActiveGuard::enter(&context.stats);

    let established = tokio::select! {
        _ = shutdown.changed() => return,
        established = establish_inbound(tcp, peer_addr, &context) => established,
    };
    let Some((mut conn, hello)) = established else {
        context.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
        return;
    };
    info!(%peer_addr, node_id = %hello.node_id, "inbound peer session established");

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                conn.goodbye().await;
                break;
            }
            frame = conn.recv_timeout(context.idle_limit) => frame,
        };
        match frame {
            Ok(WireMessage::Heartbeat { seq }) => {
                if let Err(e) = conn.send(&WireMessage::HeartbeatAck { seq }).await {
                    debug!(%peer_addr, error = %e, "heartbeat ack failed");
                    break;
                }
            }
            Ok(WireMessage::HeartbeatAck { .. }) => {}
            Ok(WireMessage::Goodbye) | Err(WireError::Closed) => {
                debug!(%peer_addr, node_id = %hello.node_id, "inbound peer left");
                break;
            }
            Ok(other) => {
                warn!(%peer_addr, message = other.kind(), "unexpected message mid-session");
                break;
            }
            Err(WireError::Timeout(_)) => {
                warn!(
                    %peer_addr,
                    node_id = %hello.node_id,
                    missed = config::INBOUND_MISSED_HEARTBEATS,
                    "inbound peer missed heartbeats, dropping"
                );
                break;
            }
            Err(e) => {
                warn!(%peer_addr, error = %e, "inbound session failed");
                break;
            }
        }
    }
}

/// TLS handshake (if any) and hello exchange. Failures are logged here and
/// counted by the caller.
async fn establish_inbound(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    context: &InboundContext,
) -> Option<(Connection, PeerHello)> {
    let stream: Box<dyn AsyncStream> = match &context.tls {
        None => Box::new(tcp),
        Some(acceptor) => {
            match tokio::time::timeout(context.handshake_timeout, acceptor.accept(tcp)).await {
                Ok(Ok(tls)) => Box::new(tls),
                Ok(Err(e)) => {
                    warn!(%peer_addr, error = %e, "tls handshake failed");
                    return None;
                }
                Err(_) => {
                    warn!(%peer_addr, "tls handshake timed out");
                    return None;
                }
            }
        }
    };

    let mut conn = Connection::new(stream, peer_addr);
    match conn
        .respond(&context.identity, context.handshake_timeout)
        .await
    {
        Ok(hello) if hello.node_id == context.identity.node_id => {
            warn!(%peer_addr, "inbound hello carries our own node_id, dropping");
            None
        }
        Ok(hello) => Some((conn, hello)),
        Err(e) => {
            warn!(%peer_addr, error = %e, "inbound hello failed");
            None
        }
    }
}
