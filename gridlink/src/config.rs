//! # Node Constants & Defaults
//!
//! Every default the bootstrap path relies on lives here. The node
//! configuration file can override most of them; the ones it cannot are
//! wire-level limits that both sides of a connection must agree on.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Configuration Schema
// ---------------------------------------------------------------------------

/// The only configuration schema version this build understands.
pub const CONFIG_SCHEMA_VERSION: &str = "1";

/// Default directory for TLS material when `cert_dir` is not set.
pub const DEFAULT_CERT_DIR: &str = "/etc/gridlink/certs";

/// Default file names resolved against `cert_dir`.
pub const DEFAULT_SERVER_CERT: &str = "server.crt";
pub const DEFAULT_SERVER_KEY: &str = "server.key";
pub const DEFAULT_CLIENT_CERT: &str = "client.crt";
pub const DEFAULT_CLIENT_KEY: &str = "client.key";

// ---------------------------------------------------------------------------
// Wire Protocol
// ---------------------------------------------------------------------------

/// Version advertised in the `hello` frame. Peers with a different major
/// version are disconnected after the handshake.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// Largest single newline-delimited frame we are willing to buffer.
/// Hello frames with a handful of endpoints are a few hundred bytes, so
/// anything near this limit is a broken or hostile peer.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Inbound connections are dropped after this many heartbeat intervals
/// without traffic.
pub const INBOUND_MISSED_HEARTBEATS: u32 = 3;

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Default heartbeat interval for connected peers, in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Peer Connector
// ---------------------------------------------------------------------------

/// Time allowed for TCP connect + TLS handshake + hello exchange.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// First retry delay after a failed connection attempt.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Ceiling for the exponential retry delay. Past this point a peer is
/// either coming back on its own or it is not coming back at all.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Growth factor applied to the delay after every consecutive failure.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Fraction of the base delay added as random jitter, so that a fleet of
/// nodes recovering from a shared outage does not reconnect in lockstep.
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

/// Consecutive failures before a peer is parked as dormant.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Interval of the slow sweep that re-attempts dormant peers.
pub const DEFAULT_DORMANT_SWEEP: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Registry Resolver
// ---------------------------------------------------------------------------

/// Per-attempt timeout for fetching a remote registry.
pub const DEFAULT_REGISTRY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts made against a remote registry before it is reported
/// unavailable for this resolution round.
pub const DEFAULT_REGISTRY_FETCH_ATTEMPTS: u32 = 3;

/// Delay before the second fetch attempt; doubles for each further attempt.
pub const DEFAULT_REGISTRY_RETRY_INITIAL: Duration = Duration::from_millis(250);

/// Interval between automatic registry refreshes, in seconds.
pub const DEFAULT_REGISTRY_AUTO_REFRESH_SECS: u64 = 600;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_defaults_are_ordered() {
        assert!(DEFAULT_BACKOFF_INITIAL < DEFAULT_BACKOFF_MAX);
        assert!(DEFAULT_BACKOFF_MULTIPLIER >= 1.0);
        assert!((0.0..=1.0).contains(&DEFAULT_BACKOFF_JITTER));
    }

    #[test]
    fn dormant_sweep_is_slower_than_backoff_cap() {
        // Dormant peers must be retried less often than transiently failing ones.
        assert!(DEFAULT_DORMANT_SWEEP > DEFAULT_BACKOFF_MAX);
    }

    #[test]
    fn frame_limit_is_sane() {
        assert!(MAX_FRAME_BYTES >= 4 * 1024);
        assert!(INBOUND_MISSED_HEARTBEATS >= 2);
    }
}
