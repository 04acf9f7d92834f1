//! # Prometheus Metrics
//!
//! Exposes operational metrics for the node at `/metrics` on the REST
//! endpoint.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] with
//! the `gridlink` prefix. The library keeps its own counters, so every
//! gauge here is sampled from the [`NodeHandle`] when a scrape arrives
//! rather than updated on the hot path.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

use gridlink::bootstrap::NodeHandle;

use crate::api::AppState;

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Peers in the table, labelled by connection state.
    pub peers: IntGaugeVec,
    /// Inbound connections accepted since start.
    pub inbound_accepted: IntGauge,
    /// Inbound connections whose TLS or hello handshake failed.
    pub handshake_failures: IntGauge,
    /// Inbound sessions currently open.
    pub inbound_active: IntGauge,
    /// Registries that failed in the latest resolution round.
    pub registries_unavailable: IntGauge,
    /// 1 while the node is Ready.
    pub ready: IntGauge,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("gridlink".into()), None)?;

        let peers = IntGaugeVec::new(
            Opts::new("peers", "Number of peers in each connection state"),
            &["state"],
        )?;
        registry.register(Box::new(peers.clone()))?;

        let inbound_accepted = IntGauge::new(
            "inbound_connections_accepted",
            "Inbound connections accepted since start",
        )?;
        registry.register(Box::new(inbound_accepted.clone()))?;

        let handshake_failures = IntGauge::new(
            "inbound_handshake_failures",
            "Inbound connections dropped during the TLS or hello handshake",
        )?;
        registry.register(Box::new(handshake_failures.clone()))?;

        let inbound_active = IntGauge::new("inbound_sessions", "Inbound sessions currently open")?;
        registry.register(Box::new(inbound_active.clone()))?;

        let registries_unavailable = IntGauge::new(
            "registries_unavailable",
            "Registries that failed in the latest resolution round",
        )?;
        registry.register(Box::new(registries_unavailable.clone()))?;

        let ready = IntGauge::new("ready", "1 when the node has completed bootstrap")?;
        registry.register(Box::new(ready.clone()))?;

        Ok(Self {
            registry,
            peers,
            inbound_accepted,
            handshake_failures,
            inbound_active,
            registries_unavailable,
            ready,
        })
    }

    /// Copies the node's current counters into the gauges.
    pub fn sample(&self, node: &NodeHandle) {
        for (state, count) in node.peer_counts() {
            self.peers.with_label_values(&[state]).set(count as i64);
        }

        let stats = node.listener_stats();
        self.inbound_accepted.set(stats.accepted as i64);
        self.handshake_failures.set(stats.handshake_failures as i64);
        self.inbound_active.set(stats.active as i64);

        self.registries_unavailable
            .set(node.registry_snapshot().unavailable().count() as i64);
        self.ready.set(i64::from(node.is_ready()));
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.sample(&state.node);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
