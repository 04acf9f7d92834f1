//! # Transport
//!
//! Everything between a socket and a peer session:
//!
//! - **endpoint**: `host:port` values and the `raw` / `tls` switch.
//! - **wire**: newline-delimited JSON framing plus the hello exchange.
//! - **listener**: binds the service and network endpoints and serves
//!   inbound peers.
//! - **dialer**: opens outbound sessions for the peer connector.

pub mod dialer;
pub mod endpoint;
pub mod listener;
pub mod wire;

pub use dialer::{Dialer, PeerConnectionError, PeerSession};
pub use endpoint::{Endpoint, EndpointParseError, Transport};
pub use listener::{
    BindError, BoundEndpoint, EndpointRole, ListenerHandle, ListenerStats, ListenerStatsSnapshot,
    TransportListener,
};
pub use wire::{Connection, LocalIdentity, PeerHello, WireError, WireMessage};

use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream a session can run over: plain TCP or either side of TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}
