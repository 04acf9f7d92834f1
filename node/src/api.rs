//! # REST API
//!
//! Builds the axum router that exposes the node's probes and peer status.
//! All endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                  | Description                                  |
//! |--------|-----------------------|----------------------------------------------|
//! | GET    | `/health`             | Liveness probe                               |
//! | GET    | `/ready`              | 200 once bootstrap reached Ready, else 503   |
//! | GET    | `/status`             | Node status summary                          |
//! | GET    | `/peers`              | Every peer record                            |
//! | GET    | `/peers/:id`          | One peer by peer id or node id               |
//! | GET    | `/registries`         | Latest registry snapshot and source reports  |
//! | POST   | `/registries/refresh` | Re-resolve registries and reconcile peers    |
//! | GET    | `/metrics`            | Prometheus text exposition                   |

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use gridlink::bootstrap::NodeHandle;

use crate::metrics::{self, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone: everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<NodeHandle>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .route("/peers", get(peers_handler))
        .route("/peers/:id", get(peer_handler))
        .route("/registries", get(registries_handler))
        .route("/registries/refresh", post(refresh_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /ready`.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub stage: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` returns 200 while the process is serving.
///
/// It deliberately ignores bootstrap progress; that is `/ready`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.node.is_ready();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        ready,
        stage: state.node.stage().as_str(),
    };
    (code, Json(body))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.node.status_report())
}

async fn peers_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.node.peer_status())
}

/// `GET /peers/:id` accepts either the table key or a learned node_id.
async fn peer_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.node.peer_state(&id) {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("unknown peer {id}"),
            }),
        )
            .into_response(),
    }
}

async fn registries_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.node.registry_snapshot();
    Json(snapshot.as_ref().clone())
}

async fn refresh_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.node.refresh_registries().await;
    tracing::info!(
        added = summary.added,
        folded = summary.folded,
        retired = summary.retired,
        updated = summary.updated,
        "registry refresh requested over the api"
    );
    Json(summary)
}
