//! Serializable views of a running node, for the HTTP API and the
//! `status` command.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::bootstrap::BootstrapStage;
use crate::registry::RegistrySnapshot;
use crate::transport::{BoundEndpoint, Endpoint, ListenerStatsSnapshot, Transport};

/// Node summary served at `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusReport {
    pub node_id: String,
    pub display_name: String,
    /// Fresh for every process start.
    pub boot_id: Uuid,
    pub version: &'static str,
    pub stage: BootstrapStage,
    pub ready: bool,
    pub transport: Transport,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub service_endpoint: Endpoint,
    pub network_endpoints: Vec<Endpoint>,
    pub listeners: Vec<BoundEndpoint>,
    pub inbound: ListenerStatsSnapshot,
    pub peers: PeerSummary,
    pub registry: RegistrySummary,
    /// SHA-256 of each CA certificate, empty for `raw` transport.
    pub ca_fingerprints: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub total: usize,
    pub by_state: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub generation: u64,
    pub nodes: usize,
    pub shadowed: usize,
    pub sources: usize,
    pub unavailable: usize,
    pub resolved_at: DateTime<Utc>,
}

impl RegistrySummary {
    pub fn from_snapshot(snapshot: &RegistrySnapshot) -> Self {
        Self {
            generation: snapshot.generation,
            nodes: snapshot.directory.len(),
            shadowed: snapshot.directory.shadowed(),
            sources: snapshot.sources.len(),
            unavailable: snapshot.unavailable().count(),
            resolved_at: snapshot.resolved_at,
        }
    }
}
