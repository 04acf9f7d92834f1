// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Gridlink: Node Bootstrap and Peer Connectivity
//!
//! Everything a Gridlink node does between "here is a config file" and
//! "I am serving and connected to my peers".
//!
//! ## Architecture
//!
//! - **node_config**: TOML configuration, validated into an immutable `NodeConfig`.
//! - **certs**: CA bundle and node certificates for `tls` transport.
//! - **registry**: file and HTTP registries merged into one node directory.
//! - **transport**: endpoints, wire framing, the listener and the dialer.
//! - **peer**: the peer table and the per-peer connection state machine.
//! - **bootstrap**: the ordered startup sequence and the live `NodeHandle`.
//! - **status**: serializable status reports.
//! - **config**: defaults and wire-level constants.
//!
//! ## Quick start
//!
//! ```no_run
//! # async fn demo() -> Result<(), gridlink::bootstrap::BootstrapError> {
//! use gridlink::bootstrap::NodeBootstrap;
//!
//! let node = NodeBootstrap::from_path("/etc/gridlink/node.toml")?.start().await?;
//! assert!(node.is_ready());
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod certs;
pub mod config;
pub mod node_config;
pub mod peer;
pub mod registry;
pub mod status;
pub mod transport;
