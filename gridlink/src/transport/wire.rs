//! # Wire Protocol
//!
//! Peers talk newline-delimited JSON. Every frame is one [`WireMessage`]
//! serialized on a single line; frames larger than
//! [`config::MAX_FRAME_BYTES`] are rejected before they are parsed.
//!
//! A session opens with a `hello` exchange (the dialing side speaks first)
//! and then carries `heartbeat` / `heartbeat_ack` pairs until either side
//! says `goodbye` or stops answering.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use super::AsyncStream;
use crate::config;

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Hello {
        node_id: String,
        display_name: String,
        /// Endpoints the sender accepts peer connections on.
        endpoints: Vec<String>,
        protocol_version: u16,
    },
    Heartbeat {
        seq: u64,
    },
    HeartbeatAck {
        seq: u64,
    },
    Goodbye,
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::Goodbye => "goodbye",
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed by peer")]
    Closed,

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },

    #[error("peer speaks protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What this node announces in its `hello`.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub node_id: String,
    pub display_name: String,
    pub endpoints: Vec<String>,
}

impl LocalIdentity {
    fn hello(&self) -> WireMessage {
        WireMessage::Hello {
            node_id: self.node_id.clone(),
            display_name: self.display_name.clone(),
            endpoints: self.endpoints.clone(),
            protocol_version: config::WIRE_PROTOCOL_VERSION,
        }
    }
}

/// The remote side's `hello`, once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHello {
    pub node_id: String,
    pub display_name: String,
    pub endpoints: Vec<String>,
}

/// A framed, established byte stream to one peer (TLS or plain TCP).
pub struct Connection {
    stream: BufReader<Box<dyn AsyncStream>>,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: Box<dyn AsyncStream>, peer_addr: SocketAddr) -> Self {
        Self {
            stream: BufReader::new(stream),
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, message: &WireMessage) -> Result<(), WireError> {
        let mut line =
            serde_json::to_vec(message).map_err(|e| WireError::Malformed(e.to_string()))?;
        line.push(b'\n');
        self.stream.write_all(&line).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one frame. `Closed` on a clean EOF between frames.
    pub async fn recv(&mut self) -> Result<WireMessage, WireError> {
        let limit = config::MAX_FRAME_BYTES;
        let mut buf = Vec::new();
        let n = (&mut self.stream)
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(WireError::Closed);
        }
        if buf.last() != Some(&b'\n') {
            return Err(if buf.len() > limit {
                WireError::FrameTooLarge { limit }
            } else {
                WireError::Closed
            });
        }
        buf.pop();
        serde_json::from_slice(&buf).map_err(|e| WireError::Malformed(e.to_string()))
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<WireMessage, WireError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| WireError::Timeout(timeout))?
    }

    /// Dialing side: send our hello, then wait for theirs.
    pub async fn initiate(
        &mut self,
        local: &LocalIdentity,
        timeout: Duration,
    ) -> Result<PeerHello, WireError> {
        self.send(&local.hello()).await?;
        let reply = self.recv_timeout(timeout).await?;
        expect_hello(reply)
    }

    /// Accepting side: wait for the dialer's hello, then answer with ours.
    pub async fn respond(
        &mut self,
        local: &LocalIdentity,
        timeout: Duration,
    ) -> Result<PeerHello, WireError> {
        let first = self.recv_timeout(timeout).await?;
        let hello = expect_hello(first)?;
        self.send(&local.hello()).await?;
        Ok(hello)
    }

    /// Best effort; the peer may already be gone.
    pub async fn goodbye(&mut self) {
        let _ = self.send(&WireMessage::Goodbye).await;
        let _ = self.stream.get_mut().shutdown().await;
    }
}

fn expect_hello(message: WireMessage) -> Result<PeerHello, WireError> {
    match message {
        WireMessage::Hello {
            node_id,
            display_name,
            endpoints,
            protocol_version,
        } => {
            if protocol_version != config::WIRE_PROTOCOL_VERSION {
                return Err(WireError::UnsupportedVersion(protocol_version));
            }
            Ok(PeerHello {
                node_id,
                display_name,
                endpoints,
            })
        }
        other => Err(WireError::Unexpected {
            expected: "hello",
            got: other.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pair() -> (Connection, Connection) {
        let (a, b) = duplex(256 * 1024);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        (
            Connection::new(Box::new(a), addr),
            Connection::new(Box::new(b), addr),
        )
    }

    fn identity(id: &str) -> LocalIdentity {
        LocalIdentity {
            node_id: id.to_string(),
            display_name: format!("{} node", id),
            endpoints: vec!["127.0.0.1:9000".to_string()],
        }
    }

    #[test]
    fn messages_use_snake_case_type_tags() {
        let json = serde_json::to_string(&WireMessage::HeartbeatAck { seq: 7 }).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat_ack","seq":7}"#);
        let goodbye: WireMessage = serde_json::from_str(r#"{"type":"goodbye"}"#).unwrap();
        assert_eq!(goodbye, WireMessage::Goodbye);
    }

    #[tokio::test]
    async fn hello_exchange_reports_both_identities() {
        let (mut dialer, mut acceptor) = pair();
        let timeout = Duration::from_secs(1);
        let alpha = identity("alpha");
        let beta = identity("beta");
        let (a, b) = tokio::join!(
            dialer.initiate(&alpha, timeout),
            acceptor.respond(&beta, timeout),
        );
        assert_eq!(a.unwrap().node_id, "beta");
        assert_eq!(b.unwrap().node_id, "alpha");
    }

    #[tokio::test]
    async fn heartbeat_before_hello_is_rejected() {
        let (mut dialer, mut acceptor) = pair();
        dialer.send(&WireMessage::Heartbeat { seq: 1 }).await.unwrap();
        let err = acceptor
            .respond(&identity("beta"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Unexpected { got: "heartbeat", .. }));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = pair();
        let big = vec![b'x'; config::MAX_FRAME_BYTES + 10];
        a.stream.write_all(&big).await.unwrap();
        a.stream.write_all(b"\n").await.unwrap();
        let err = b.recv().await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let (mut a, mut b) = pair();
        a.stream.write_all(b"not json\n").await.unwrap();
        assert!(matches!(b.recv().await, Err(WireError::Malformed(_))));
    }

    #[tokio::test]
    async fn eof_is_closed() {
        let (a, mut b) = pair();
        drop(a);
        assert!(matches!(b.recv().await, Err(WireError::Closed)));
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (_a, mut b) = pair();
        let err = b.recv_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, WireError::Timeout(_)));
    }
}
