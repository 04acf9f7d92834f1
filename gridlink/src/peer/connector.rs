//! # Peer Connector
//!
//! Keeps outbound sessions open to every static and registry peer. Each
//! peer gets one task that walks the state machine:
//!
//! ```text
//! Unknown -> Connecting -> Connected --(liveness lost)--> Connecting
//!                 |
//!                 v
//!              Failed -> Backoff(until) -> Connecting
//!                 |
//!                 v  (max_attempts reached)
//!              Dormant(until) -> Connecting
//! ```
//!
//! Waits are `tokio::time::sleep` raced against the peer's cancel channel,
//! so retiring a peer or shutting down never waits out a backoff.
//!
//! Static peers always stay. A registry node that advertises a static
//! peer's endpoint is folded into that static record (its identity is
//! adopted, provenance stays static) instead of being dialed twice. The
//! node never dials its own node_id or its own endpoints.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::table::{PeerRecord, PeerTable, Provenance};
use crate::registry::RegistryDirectory;
use crate::transport::{Dialer, Endpoint, PeerConnectionError, PeerSession};

/// Shared by every per-peer task.
struct PeerContext {
    table: Arc<PeerTable>,
    dialer: Dialer,
    policy: BackoffPolicy,
    heartbeat: Duration,
}

struct PeerTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Changes made by one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub added: usize,
    pub folded: usize,
    pub retired: usize,
    pub updated: usize,
}

pub struct PeerConnector {
    context: Arc<PeerContext>,
    local_node_id: String,
    local_endpoints: Vec<Endpoint>,
    tasks: Mutex<HashMap<String, PeerTask>>,
    closed: AtomicBool,
}

impl PeerConnector {
    pub fn new(
        dialer: Dialer,
        policy: BackoffPolicy,
        heartbeat: Duration,
        local_node_id: impl Into<String>,
        local_endpoints: Vec<Endpoint>,
    ) -> Self {
        Self {
            context: Arc::new(PeerContext {
                table: Arc::new(PeerTable::new()),
                dialer,
                policy,
                heartbeat,
            }),
            local_node_id: local_node_id.into(),
            local_endpoints,
            tasks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> Arc<PeerTable> {
        Arc::clone(&self.context.table)
    }

    /// Registers the static peers and the registry directory, then starts
    /// one task per peer. Returns the number of peers dispatched.
    pub fn dispatch(&self, static_peers: &[Endpoint], directory: &RegistryDirectory) -> usize {
        for endpoint in static_peers {
            if self.local_endpoints.contains(endpoint) {
                warn!(peer = %endpoint, "static peer is one of this node's endpoints, skipping");
                continue;
            }
            let record = PeerRecord::new(
                endpoint.to_string(),
                None,
                vec![endpoint.clone()],
                Provenance::Static,
            );
            if self.context.table.insert(record) {
                self.spawn(endpoint.to_string());
            }
        }
        self.reconcile(directory);
        self.tasks.lock().len()
    }

    /// Brings the registry peers in line with `directory`: new nodes are
    /// dialed, nodes no longer listed are retired, static matches are
    /// folded.
    pub fn reconcile(&self, directory: &RegistryDirectory) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        if self.closed.load(Ordering::SeqCst) {
            return summary;
        }
        let table = &self.context.table;
        let mut wanted = HashSet::new();

        for entry in directory.iter() {
            let node = &entry.node;
            if node.identity == self.local_node_id {
                continue;
            }
            if let Some(static_id) = table.find_static_match(&node.identity, &node.endpoints) {
                table.adopt_identity(&static_id, &node.identity);
                summary.folded += 1;
                debug!(peer = %static_id, node_id = %node.identity, "registry node folded into static peer");
                continue;
            }
            let endpoints: Vec<Endpoint> = node
                .endpoints
                .iter()
                .filter(|e| !self.local_endpoints.contains(e))
                .cloned()
                .collect();
            if endpoints.is_empty() {
                continue;
            }

            wanted.insert(node.identity.clone());
            let record = PeerRecord::new(
                node.identity.clone(),
                Some(node.identity.clone()),
                endpoints.clone(),
                Provenance::Registry,
            );
            if table.insert(record) {
                self.spawn(node.identity.clone());
                summary.added += 1;
            } else if table.update_endpoints(&node.identity, &endpoints) {
                summary.updated += 1;
            }
        }

        for id in table.ids_with(Provenance::Registry) {
            if !wanted.contains(&id) {
                self.retire(&id);
                summary.retired += 1;
            }
        }

        if summary != ReconcileSummary::default() {
            info!(
                added = summary.added,
                folded = summary.folded,
                updated = summary.updated,
                retired = summary.retired,
                "peer set reconciled with registry"
            );
        }
        summary
    }

    /// Stops every peer task, closing established sessions. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        for (_, task) in &tasks {
            let _ = task.cancel.send(true);
        }
        for (id, task) in tasks {
            if let Err(e) = task.handle.await {
                warn!(peer = %id, error = %e, "peer task ended abnormally");
            }
        }
        info!("peer connector stopped");
    }

    fn spawn(&self, id: String) {
        // Checked under the lock: shutdown drains `tasks` after setting
        // `closed`, so a task inserted here is always seen by the drain.
        let mut tasks = self.tasks.lock();
        if self.closed.load(Ordering::SeqCst) {
            debug!(peer = %id, "connector closed, not starting peer task");
            return;
        }
        let (cancel, cancelled) = watch::channel(false);
        let handle = tokio::spawn(drive_peer(
            Arc::clone(&self.context),
            id.clone(),
            cancelled,
        ));
        tasks.insert(id, PeerTask { cancel, handle });
    }

    fn retire(&self, id: &str) {
        if let Some(task) = self.tasks.lock().remove(id) {
            let _ = task.cancel.send(true);
        }
        self.context.table.remove(id);
        info!(peer = %id, "registry peer retired");
    }
}

// ---------------------------------------------------------------------------
// Per-peer task
// ---------------------------------------------------------------------------

async fn drive_peer(context: Arc<PeerContext>, id: String, mut cancel: watch::Receiver<bool>) {
    let mut rng = StdRng::from_entropy();
    let table = &context.table;

    loop {
        if *cancel.borrow() {
            return;
        }
        let Some(target) = table.begin_connect(&id) else {
            debug!(peer = %id, "peer removed or already connecting, task exiting");
            return;
        };

        let attempt = tokio::select! {
            _ = cancel.changed() => return,
            attempt = connect_any(&context.dialer, &target.endpoints, target.expected_node_id.as_deref()) => attempt,
        };

        match attempt {
            Ok(session) => {
                let node_id = session.hello().node_id.clone();
                if !table.mark_connected(&id, &node_id) {
                    session.close().await;
                    return;
                }
                info!(peer = %id, %node_id, endpoint = %session.endpoint(), "peer connected");

                match hold_session(&context, session, &mut cancel).await {
                    Some(lost) => {
                        warn!(peer = %id, error = %lost, "peer lost liveness, reconnecting");
                        table.note_session_lost(&id, &lost.to_string());
                    }
                    None => return,
                }
            }
            Err(e) => {
                let reason = e.to_string();
                let Some(count) = table.mark_failed(&id, &reason) else {
                    return;
                };
                let wait = if context.policy.is_exhausted(count.consecutive) {
                    let sweep = context.policy.dormant_sweep;
                    table.mark_dormant(&id, sweep);
                    warn!(
                        peer = %id,
                        failures = count.consecutive,
                        retry_in_secs = sweep.as_secs(),
                        error = %reason,
                        "peer unreachable, going dormant"
                    );
                    sweep
                } else {
                    let delay =
                        context
                            .policy
                            .next_delay(count.consecutive, count.previous_delay, &mut rng);
                    table.mark_backoff(&id, delay);
                    debug!(
                        peer = %id,
                        failures = count.consecutive,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "peer connect failed, backing off"
                    );
                    delay
                };

                tokio::select! {
                    _ = cancel.changed() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
}

/// Tries each endpoint in order; the first session wins.
async fn connect_any(
    dialer: &Dialer,
    endpoints: &[Endpoint],
    expected: Option<&str>,
) -> Result<PeerSession, PeerConnectionError> {
    let mut last_error = None;
    for endpoint in endpoints {
        match dialer.connect(endpoint, expected).await {
            Ok(session) => return Ok(session),
            Err(e) => {
                debug!(%endpoint, error = %e, "endpoint attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(PeerConnectionError::NoEndpoints))
}

/// Heartbeats until the session fails (`Some`) or the peer is cancelled
/// (`None`, after saying goodbye).
async fn hold_session(
    context: &PeerContext,
    mut session: PeerSession,
    cancel: &mut watch::Receiver<bool>,
) -> Option<PeerConnectionError> {
    let ack_timeout = context.dialer.connect_timeout();
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                session.close().await;
                return None;
            }
            _ = tokio::time::sleep(context.heartbeat) => {}
        }
        // A silent peer must not hold cancellation for the whole ack timeout.
        let beat = tokio::select! {
            _ = cancel.changed() => None,
            beat = session.heartbeat(ack_timeout) => Some(beat),
        };
        match beat {
            None => {
                session.close().await;
                return None;
            }
            Some(Err(e)) => return Some(e),
            Some(Ok(())) => {}
        }
    }
}
