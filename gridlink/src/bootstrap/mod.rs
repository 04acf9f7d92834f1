//! # Node Bootstrap
//!
//! Brings a node from a configuration file to a serving state, in order:
//!
//! ```text
//! Init -> ConfigLoaded -> CertsReady | CertsSkipped -> RegistryResolved
//!      -> ListenerBound -> PeersDispatched -> Ready
//! ```
//!
//! Anything that goes wrong before the listener is bound stops the node
//! with a [`BootstrapError`] naming the stage. Registries and peers are
//! best effort: a dead registry or an unreachable peer is recorded and the
//! node still becomes ready.
//!
//! The resulting [`NodeHandle`] owns the listener, the peer connector and
//! the registry resolver. [`NodeHandle::shutdown`] drains in the reverse
//! order (listener first, then peers) and may be called any number of
//! times.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::certs::{self, CertError};
use crate::node_config::{ConfigError, ConfigOverrides, NodeConfig};
use crate::peer::{BackoffPolicy, PeerConnector, PeerRecord, ReconcileSummary};
use crate::registry::{RegistryResolver, RegistrySnapshot};
use crate::status::{NodeStatusReport, PeerSummary, RegistrySummary};
use crate::transport::{
    BindError, BoundEndpoint, Dialer, Endpoint, ListenerHandle, ListenerStatsSnapshot,
    LocalIdentity, TransportListener,
};

// ---------------------------------------------------------------------------
// Stages and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStage {
    Init,
    ConfigLoaded,
    CertsReady,
    CertsSkipped,
    RegistryResolved,
    ListenerBound,
    PeersDispatched,
    Ready,
    Draining,
    Stopped,
    Failed,
}

impl BootstrapStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ConfigLoaded => "config_loaded",
            Self::CertsReady => "certs_ready",
            Self::CertsSkipped => "certs_skipped",
            Self::RegistryResolved => "registry_resolved",
            Self::ListenerBound => "listener_bound",
            Self::PeersDispatched => "peers_dispatched",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal startup failure.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("certificates: {0}")]
    Cert(#[from] CertError),

    #[error("listener: {0}")]
    Bind(#[from] BindError),
}

impl BootstrapError {
    /// The stage that could not be reached.
    pub fn stage(&self) -> BootstrapStage {
        match self {
            Self::Config(_) => BootstrapStage::ConfigLoaded,
            Self::Cert(_) => BootstrapStage::CertsReady,
            Self::Bind(_) => BootstrapStage::ListenerBound,
        }
    }
}

fn enter(stage: BootstrapStage) {
    info!(stage = %stage, "bootstrap stage reached");
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Runs the startup sequence for one validated configuration.
pub struct NodeBootstrap {
    config: NodeConfig,
}

impl NodeBootstrap {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Loads the configuration file; the `Init -> ConfigLoaded` step.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BootstrapError> {
        Self::from_path_with_overrides(path, &ConfigOverrides::default())
    }

    /// Like [`NodeBootstrap::from_path`], with command-line or environment
    /// values replacing the file's before validation.
    pub fn from_path_with_overrides(
        path: impl AsRef<Path>,
        overrides: &ConfigOverrides,
    ) -> Result<Self, BootstrapError> {
        enter(BootstrapStage::Init);
        let config =
            NodeConfig::load_with_overrides(path, overrides).map_err(|e| fail(e.into()))?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Runs every remaining stage and returns the live node.
    pub async fn start(self) -> Result<Arc<NodeHandle>, BootstrapError> {
        self.run().await.map_err(fail)
    }

    async fn run(self) -> Result<Arc<NodeHandle>, BootstrapError> {
        let config = self.config;
        enter(BootstrapStage::ConfigLoaded);
        info!(
            node_id = %config.node_id(),
            transport = %config.transport(),
            peers = config.peers().len(),
            registries = config.registries().len(),
            "starting node"
        );

        // -- certificates ---------------------------------------------------
        let bundle = certs::load_for(&config)?;
        enter(if bundle.is_some() {
            BootstrapStage::CertsReady
        } else {
            BootstrapStage::CertsSkipped
        });
        let ca_fingerprints = bundle
            .as_ref()
            .map(|b| b.ca_fingerprints().to_vec())
            .unwrap_or_default();

        // -- registries -----------------------------------------------------
        let resolver = match RegistryResolver::new(
            config.registries().to_vec(),
            config.resolver().clone(),
        ) {
            Ok(resolver) => Some(Arc::new(resolver)),
            Err(e) => {
                warn!(error = %e, "registry resolver unavailable, continuing with static peers only");
                None
            }
        };
        let snapshot = match &resolver {
            Some(resolver) => resolver.resolve().await,
            None => Arc::new(RegistrySnapshot::empty()),
        };
        enter(BootstrapStage::RegistryResolved);

        // -- listener -------------------------------------------------------
        let settings = config.connector();
        let identity = LocalIdentity {
            node_id: config.node_id().to_string(),
            display_name: config.display_name().to_string(),
            endpoints: config
                .network_endpoints()
                .iter()
                .map(ToString::to_string)
                .collect(),
        };
        let dialer = Dialer::new(
            identity.clone(),
            config.transport(),
            bundle.as_ref(),
            settings.connect_timeout,
        )
        .map_err(|e| BindError::TlsHandshakeConfigInvalid(e.to_string()))?;

        let listener = TransportListener::new(identity, settings.heartbeat, settings.connect_timeout)
            .bind(
                config.service_endpoint(),
                config.network_endpoints(),
                config.transport(),
                bundle.as_ref(),
            )
            .await?;
        enter(BootstrapStage::ListenerBound);

        // -- peers ----------------------------------------------------------
        let connector = Arc::new(PeerConnector::new(
            dialer,
            BackoffPolicy::from_settings(settings),
            settings.heartbeat,
            config.node_id(),
            own_endpoints(&config, &listener),
        ));
        let dispatched = connector.dispatch(config.peers(), &snapshot.directory);
        info!(dispatched, "peer connections dispatched");
        enter(BootstrapStage::PeersDispatched);

        let handle = Arc::new(NodeHandle {
            boot_id: Uuid::new_v4(),
            started_at: Utc::now(),
            config,
            stage: RwLock::new(BootstrapStage::PeersDispatched),
            listener,
            connector,
            resolver,
            ca_fingerprints,
            halt: watch::channel(false).0,
            refresh: Mutex::new(None),
            stopping: AtomicBool::new(false),
        });
        handle.spawn_refresh();
        handle.set_stage(BootstrapStage::Ready);
        Ok(handle)
    }
}

fn fail(e: BootstrapError) -> BootstrapError {
    error!(stage = %e.stage(), error = %e, "bootstrap failed");
    e
}

/// Configured endpoints plus the addresses actually bound, so a node
/// listening on port 0 still recognizes itself.
fn own_endpoints(config: &NodeConfig, listener: &ListenerHandle) -> Vec<Endpoint> {
    let mut own: Vec<Endpoint> = std::iter::once(config.service_endpoint())
        .chain(config.network_endpoints())
        .cloned()
        .collect();
    for addr in listener.local_addrs() {
        if let Ok(endpoint) = Endpoint::new(addr.ip().to_string(), addr.port()) {
            if !own.contains(&endpoint) {
                own.push(endpoint);
            }
        }
    }
    own
}

// ---------------------------------------------------------------------------
// Node handle
// ---------------------------------------------------------------------------

/// A bootstrapped node. Shared as `Arc<NodeHandle>` with the API layer.
pub struct NodeHandle {
    boot_id: Uuid,
    started_at: DateTime<Utc>,
    config: NodeConfig,
    stage: RwLock<BootstrapStage>,
    listener: ListenerHandle,
    connector: Arc<PeerConnector>,
    resolver: Option<Arc<RegistryResolver>>,
    ca_fingerprints: Vec<String>,
    /// Flips to `true` once shutdown starts; registry rounds race it.
    halt: watch::Sender<bool>,
    refresh: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl NodeHandle {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn boot_id(&self) -> Uuid {
        self.boot_id
    }

    pub fn stage(&self) -> BootstrapStage {
        *self.stage.read()
    }

    /// Readiness probe: true only in `Ready`.
    pub fn is_ready(&self) -> bool {
        self.stage() == BootstrapStage::Ready
    }

    /// Copies of every peer record, ordered by peer id.
    pub fn peer_status(&self) -> Vec<PeerRecord> {
        self.connector.table().snapshot()
    }

    /// One peer, by peer id or node_id.
    pub fn peer_state(&self, key: &str) -> Option<PeerRecord> {
        self.connector.table().get(key)
    }

    /// Peer count per connection state, every state present.
    pub fn peer_counts(&self) -> BTreeMap<&'static str, usize> {
        self.connector.table().state_counts()
    }

    /// The latest published registry snapshot.
    pub fn registry_snapshot(&self) -> Arc<RegistrySnapshot> {
        match &self.resolver {
            Some(resolver) => resolver.snapshot(),
            None => Arc::new(RegistrySnapshot::empty()),
        }
    }

    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.listener.local_addrs()
    }

    pub fn listener_endpoints(&self) -> &[BoundEndpoint] {
        self.listener.bound()
    }

    pub fn listener_stats(&self) -> ListenerStatsSnapshot {
        self.listener.stats()
    }

    pub fn ca_fingerprints(&self) -> &[String] {
        &self.ca_fingerprints
    }

    /// Resolves the registries now and reconciles the peer set. A round
    /// still fetching when shutdown starts is abandoned and changes nothing.
    pub async fn refresh_registries(&self) -> ReconcileSummary {
        let Some(resolver) = &self.resolver else {
            return ReconcileSummary::default();
        };
        let mut halt = self.halt.subscribe();
        tokio::select! {
            _ = halted(&mut halt) => ReconcileSummary::default(),
            snapshot = resolver.resolve() => self.connector.reconcile(&snapshot.directory),
        }
    }

    pub fn status_report(&self) -> NodeStatusReport {
        let table = self.connector.table();
        NodeStatusReport {
            node_id: self.config.node_id().to_string(),
            display_name: self.config.display_name().to_string(),
            boot_id: self.boot_id,
            version: env!("CARGO_PKG_VERSION"),
            stage: self.stage(),
            ready: self.is_ready(),
            transport: self.config.transport(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            service_endpoint: self.config.service_endpoint().clone(),
            network_endpoints: self.config.network_endpoints().to_vec(),
            listeners: self.listener.bound().to_vec(),
            inbound: self.listener.stats(),
            peers: PeerSummary {
                total: table.len(),
                by_state: self.peer_counts(),
            },
            registry: RegistrySummary::from_snapshot(&self.registry_snapshot()),
            ca_fingerprints: self.ca_fingerprints.clone(),
        }
    }

    /// Ready -> Draining -> Stopped. Closes the listener, then every peer
    /// session. Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_stage(BootstrapStage::Draining);

        self.halt.send_replace(true);
        let refresh = self.refresh.lock().take();
        if let Some(task) = refresh {
            if let Err(e) = task.await {
                warn!(error = %e, "registry refresh task ended abnormally");
            }
        }
        self.listener.close().await;
        self.connector.shutdown().await;

        self.set_stage(BootstrapStage::Stopped);
    }

    fn set_stage(&self, stage: BootstrapStage) {
        *self.stage.write() = stage;
        enter(stage);
    }

    fn spawn_refresh(&self) {
        let Some(resolver) = self.resolver.clone() else {
            return;
        };
        let Some(interval) = self.config.resolver().auto_refresh else {
            return;
        };
        if resolver.sources().is_empty() {
            return;
        }
        let connector = Arc::clone(&self.connector);
        let mut halt = self.halt.subscribe();
        let task = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "registry auto-refresh enabled");
            loop {
                tokio::select! {
                    _ = halted(&mut halt) => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let snapshot = tokio::select! {
                    _ = halted(&mut halt) => break,
                    snapshot = resolver.resolve() => snapshot,
                };
                connector.reconcile(&snapshot.directory);
            }
            debug!("registry auto-refresh stopped");
        });
        *self.refresh.lock() = Some(task);
    }
}

/// Completes once `halt` reads `true`, or its sender is gone.
async fn halted(halt: &mut watch::Receiver<bool>) {
    loop {
        if *halt.borrow_and_update() {
            return;
        }
        if halt.changed().await.is_err() {
            return;
        }
    }
}

/// Upper bound callers should allow [`NodeHandle::shutdown`] to drain.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
