//! # Peer Table
//!
//! The single owned record of every outbound peer. All state changes go
//! through the methods here, each taking the one table lock, so a peer's
//! record is never half-updated and readers only ever see copies.
//!
//! Connection attempts are admitted through [`PeerTable::begin_connect`],
//! which refuses a peer that is already `Connecting`. That check and the
//! state change happen under the same lock.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};

use crate::transport::Endpoint;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Connection state of one outbound peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PeerState {
    Unknown,
    Connecting,
    Connected,
    Failed { reason: String },
    Backoff { until: DateTime<Utc> },
    Dormant { until: DateTime<Utc> },
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed { .. } => "failed",
            Self::Backoff { .. } => "backoff",
            Self::Dormant { .. } => "dormant",
        }
    }

    pub const NAMES: [&'static str; 6] = [
        "unknown",
        "connecting",
        "connected",
        "failed",
        "backoff",
        "dormant",
    ];
}

/// Where a peer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Listed in the node's `peers`.
    Static,
    /// Discovered through a registry.
    Registry,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    /// Table key: the registry node_id, or the endpoint text for a static
    /// peer.
    pub id: String,
    /// Known from the registry or learned from the peer's hello.
    pub node_id: Option<String>,
    /// Tried in order on every attempt.
    pub endpoints: Vec<Endpoint>,
    pub provenance: Provenance,
    pub state: PeerState,
    pub consecutive_failures: u32,
    #[serde(rename = "last_delay_ms", serialize_with = "millis")]
    pub last_delay: Option<Duration>,
    pub last_error: Option<String>,
    pub last_transition: DateTime<Utc>,
}

fn millis<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

impl PeerRecord {
    pub fn new(
        id: impl Into<String>,
        node_id: Option<String>,
        endpoints: Vec<Endpoint>,
        provenance: Provenance,
    ) -> Self {
        Self {
            id: id.into(),
            node_id,
            endpoints,
            provenance,
            state: PeerState::Unknown,
            consecutive_failures: 0,
            last_delay: None,
            last_error: None,
            last_transition: Utc::now(),
        }
    }

    fn set_state(&mut self, state: PeerState) {
        self.state = state;
        self.last_transition = Utc::now();
    }
}

/// What a connection attempt needs, copied out under the lock.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub endpoints: Vec<Endpoint>,
    /// Identity the remote side must present, when known.
    pub expected_node_id: Option<String>,
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy)]
pub struct FailureCount {
    pub consecutive: u32,
    pub previous_delay: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record. Returns `false` and leaves the table unchanged if the
    /// id is already present.
    pub fn insert(&self, record: PeerRecord) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains_key(&record.id) {
            return false;
        }
        peers.insert(record.id.clone(), record);
        true
    }

    pub fn remove(&self, id: &str) -> Option<PeerRecord> {
        self.peers.lock().remove(id)
    }

    /// Looks a peer up by table id, falling back to node_id.
    pub fn get(&self, key: &str) -> Option<PeerRecord> {
        let peers = self.peers.lock();
        peers.get(key).cloned().or_else(|| {
            peers
                .values()
                .find(|r| r.node_id.as_deref() == Some(key))
                .cloned()
        })
    }

    /// Copies of every record, ordered by id.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<_> = self.peers.lock().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Number of peers in each state, every state name present.
    pub fn state_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts: BTreeMap<_, _> = PeerState::NAMES.iter().map(|n| (*n, 0)).collect();
        for record in self.peers.lock().values() {
            *counts.entry(record.state.name()).or_insert(0) += 1;
        }
        counts
    }

    /// Ids of peers with the given provenance.
    pub fn ids_with(&self, provenance: Provenance) -> Vec<String> {
        self.peers
            .lock()
            .values()
            .filter(|r| r.provenance == provenance)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Static record that either advertises one of `endpoints` or already
    /// carries `node_id`.
    pub fn find_static_match(&self, node_id: &str, endpoints: &[Endpoint]) -> Option<String> {
        self.peers
            .lock()
            .values()
            .find(|r| {
                r.provenance == Provenance::Static
                    && (r.node_id.as_deref() == Some(node_id)
                        || r.endpoints.iter().any(|e| endpoints.contains(e)))
            })
            .map(|r| r.id.clone())
    }

    /// Gives a static peer the identity a registry advertises for it.
    /// An identity learned from the peer itself is kept.
    pub fn adopt_identity(&self, id: &str, node_id: &str) {
        if let Some(record) = self.peers.lock().get_mut(id) {
            if record.node_id.is_none() {
                record.node_id = Some(node_id.to_string());
            }
        }
    }

    /// Replaces a registry peer's endpoints. Returns whether they changed.
    pub fn update_endpoints(&self, id: &str, endpoints: &[Endpoint]) -> bool {
        match self.peers.lock().get_mut(id) {
            Some(record) if record.endpoints != endpoints => {
                record.endpoints = endpoints.to_vec();
                true
            }
            _ => false,
        }
    }

    // -- transitions --------------------------------------------------------

    /// Moves the peer to `Connecting` unless it is already there.
    ///
    /// `None` if the peer is unknown or an attempt is already in flight.
    pub fn begin_connect(&self, id: &str) -> Option<ConnectTarget> {
        let mut peers = self.peers.lock();
        let record = peers.get_mut(id)?;
        if record.state == PeerState::Connecting {
            return None;
        }
        record.set_state(PeerState::Connecting);
        Some(ConnectTarget {
            endpoints: record.endpoints.clone(),
            expected_node_id: record.node_id.clone(),
        })
    }

    /// Records a successful handshake and clears the failure streak.
    pub fn mark_connected(&self, id: &str, node_id: &str) -> bool {
        let mut peers = self.peers.lock();
        let Some(record) = peers.get_mut(id) else {
            return false;
        };
        record.node_id.get_or_insert_with(|| node_id.to_string());
        record.consecutive_failures = 0;
        record.last_delay = None;
        record.last_error = None;
        record.set_state(PeerState::Connected);
        true
    }

    /// Records a failed attempt. `None` if the peer has been removed.
    pub fn mark_failed(&self, id: &str, reason: &str) -> Option<FailureCount> {
        let mut peers = self.peers.lock();
        let record = peers.get_mut(id)?;
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_error = Some(reason.to_string());
        record.set_state(PeerState::Failed {
            reason: reason.to_string(),
        });
        Some(FailureCount {
            consecutive: record.consecutive_failures,
            previous_delay: record.last_delay,
        })
    }

    pub fn mark_backoff(&self, id: &str, delay: Duration) -> bool {
        let mut peers = self.peers.lock();
        let Some(record) = peers.get_mut(id) else {
            return false;
        };
        record.last_delay = Some(delay);
        record.set_state(PeerState::Backoff {
            until: Utc::now() + delay_as_chrono(delay),
        });
        true
    }

    pub fn mark_dormant(&self, id: &str, sweep: Duration) -> bool {
        let mut peers = self.peers.lock();
        let Some(record) = peers.get_mut(id) else {
            return false;
        };
        record.set_state(PeerState::Dormant {
            until: Utc::now() + delay_as_chrono(sweep),
        });
        true
    }

    /// Records why an established session ended. The state stays
    /// `Connected` until the next `begin_connect`.
    pub fn note_session_lost(&self, id: &str, reason: &str) {
        if let Some(record) = self.peers.lock().get_mut(id) {
            record.last_error = Some(reason.to_string());
        }
    }
}

fn delay_as_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}
