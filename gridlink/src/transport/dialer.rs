//! Outbound sessions: TCP connect, optional TLS, hello exchange, and the
//! heartbeat round-trips the peer connector uses to check liveness.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::wire::{Connection, LocalIdentity, PeerHello, WireError, WireMessage};
use super::{AsyncStream, Endpoint, Transport};
use crate::certs::{self, CertBundle, TlsConfigError};

/// Why an outbound attempt or an established session failed. Never fatal:
/// the connector records it on the peer and schedules a retry.
#[derive(Debug, Error)]
pub enum PeerConnectionError {
    #[error("connecting to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: Endpoint, timeout_ms: u64 },

    #[error("connecting to {endpoint} failed: {reason}")]
    Connect { endpoint: Endpoint, reason: String },

    #[error("tls handshake with {endpoint} failed: {reason}")]
    Tls { endpoint: Endpoint, reason: String },

    #[error("hello with {endpoint} failed: {source}")]
    Handshake {
        endpoint: Endpoint,
        #[source]
        source: WireError,
    },

    #[error("{endpoint} identified as '{actual}', expected '{expected}'")]
    IdentityMismatch {
        endpoint: Endpoint,
        expected: String,
        actual: String,
    },

    #[error("peer has no endpoints to dial")]
    NoEndpoints,

    #[error("{endpoint} is this node")]
    SelfConnection { endpoint: Endpoint },

    #[error("lost liveness with {endpoint}: {source}")]
    Liveness {
        endpoint: Endpoint,
        #[source]
        source: WireError,
    },
}

/// Opens outbound sessions on behalf of the peer connector.
#[derive(Clone)]
pub struct Dialer {
    identity: Arc<LocalIdentity>,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
}

impl Dialer {
    /// With `tls`, `certs` must be present.
    pub fn new(
        identity: LocalIdentity,
        transport: Transport,
        certs: Option<&CertBundle>,
        connect_timeout: Duration,
    ) -> Result<Self, TlsConfigError> {
        let tls = match (transport, certs) {
            (Transport::Raw, _) => None,
            (Transport::Tls, None) => {
                return Err(TlsConfigError(
                    "tls transport requires a certificate bundle".to_string(),
                ))
            }
            (Transport::Tls, Some(bundle)) => {
                Some(TlsConnector::from(certs::client_config(bundle)?))
            }
        };
        Ok(Self {
            identity: Arc::new(identity),
            tls,
            connect_timeout,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connects and exchanges hellos. When `expected` is set, the remote
    /// node_id must match it.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        expected: Option<&str>,
    ) -> Result<PeerSession, PeerConnectionError> {
        let timeout = self.connect_timeout;
        let session = tokio::time::timeout(timeout, self.establish(endpoint))
            .await
            .map_err(|_| PeerConnectionError::Timeout {
                endpoint: endpoint.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })??;

        let actual = &session.hello.node_id;
        if *actual == self.identity.node_id {
            return Err(PeerConnectionError::SelfConnection {
                endpoint: endpoint.clone(),
            });
        }
        if let Some(expected) = expected {
            if actual != expected {
                return Err(PeerConnectionError::IdentityMismatch {
                    endpoint: endpoint.clone(),
                    expected: expected.to_string(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(session)
    }

    async fn establish(&self, endpoint: &Endpoint) -> Result<PeerSession, PeerConnectionError> {
        let tcp = TcpStream::connect(endpoint.socket_tuple())
            .await
            .map_err(|e| PeerConnectionError::Connect {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        let peer_addr = tcp
            .peer_addr()
            .map_err(|e| PeerConnectionError::Connect {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        let _ = tcp.set_nodelay(true);

        let stream: Box<dyn AsyncStream> = match &self.tls {
            None => Box::new(tcp),
            Some(connector) => {
                let tls_error = |reason: String| PeerConnectionError::Tls {
                    endpoint: endpoint.clone(),
                    reason,
                };
                let name = ServerName::try_from(endpoint.host().to_string())
                    .map_err(|e| tls_error(e.to_string()))?;
                let tls = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| tls_error(e.to_string()))?;
                Box::new(tls)
            }
        };

        let mut conn = Connection::new(stream, peer_addr);
        let hello = conn
            .initiate(&self.identity, self.connect_timeout)
            .await
            .map_err(|source| PeerConnectionError::Handshake {
                endpoint: endpoint.clone(),
                source,
            })?;

        Ok(PeerSession {
            conn,
            endpoint: endpoint.clone(),
            hello,
            seq: 0,
        })
    }
}

/// An established outbound session.
pub struct PeerSession {
    conn: Connection,
    endpoint: Endpoint,
    hello: PeerHello,
    seq: u64,
}

impl PeerSession {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The remote side's hello.
    pub fn hello(&self) -> &PeerHello {
        &self.hello
    }

    /// Sends one heartbeat and waits up to `timeout` for its ack. Heartbeats
    /// the peer sends in the meantime are answered.
    pub async fn heartbeat(&mut self, timeout: Duration) -> Result<(), PeerConnectionError> {
        self.seq += 1;
        let seq = self.seq;
        tokio::time::timeout(timeout, self.exchange_heartbeat(seq))
            .await
            .unwrap_or(Err(WireError::Timeout(timeout)))
            .map_err(|source| PeerConnectionError::Liveness {
                endpoint: self.endpoint.clone(),
                source,
            })
    }

    async fn exchange_heartbeat(&mut self, seq: u64) -> Result<(), WireError> {
        self.conn.send(&WireMessage::Heartbeat { seq }).await?;
        loop {
            match self.conn.recv().await? {
                WireMessage::HeartbeatAck { seq: acked } if acked == seq => return Ok(()),
                WireMessage::HeartbeatAck { .. } => {}
                WireMessage::Heartbeat { seq: theirs } => {
                    self.conn
                        .send(&WireMessage::HeartbeatAck { seq: theirs })
                        .await?;
                }
                WireMessage::Goodbye => return Err(WireError::Closed),
                other => {
                    return Err(WireError::Unexpected {
                        expected: "heartbeat_ack",
                        got: other.kind(),
                    })
                }
            }
        }
    }

    pub async fn close(mut self) {
        self.conn.goodbye().await;
    }
}
