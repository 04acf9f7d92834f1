//! # Peers
//!
//! Outbound connectivity: the [`PeerTable`] of records, the
//! [`BackoffPolicy`] that spaces out retries, and the [`PeerConnector`]
//! that runs one task per peer.

pub mod backoff;
pub mod connector;
pub mod table;

pub use backoff::BackoffPolicy;
pub use connector::{PeerConnector, ReconcileSummary};
pub use table::{PeerRecord, PeerState, PeerTable, Provenance};
