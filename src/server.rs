//! Axum router construction.
//!
//! The [`app`] function wires the control surface, the peer RPC endpoints,
//! health, metrics and the OpenAPI document into one [`axum::Router`].

use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::handlers::{control, raft};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the raftguard HTTP surface.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "raftguard",
        version = "0.1.0",
        description = "Raft consensus and automatic-failover controller"
    ),
    paths(
        health_check,
        control::init,
        control::list_nodes,
        control::add_node,
        control::remove_node,
        control::status,
        control::worker_state,
        control::healthy,
        control::leader,
        control::health_report,
        control::set_debug,
        control::log_stats,
        control::log_entry,
        raft::request_vote,
        raft::append_entries,
    ),
    components(schemas(crate::errors::ErrorBody)),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Control", description = "Bootstrap and membership changes"),
        (name = "Status", description = "Cluster state queries"),
        (name = "Diagnostics", description = "Debug logging and log introspection"),
        (name = "Raft", description = "Peer-to-peer consensus RPCs"),
    )
)]
pub struct ApiDoc;

/// Build the axum [`Router`] with every route.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(openapi_json))
        // Control surface
        .route("/control/init", post(control::init))
        .route("/control/nodes", get(control::list_nodes).post(control::add_node))
        .route("/control/nodes/:id", delete(control::remove_node))
        .route("/control/status", get(control::status))
        .route("/control/worker-state", get(control::worker_state))
        .route("/control/healthy", get(control::healthy))
        .route("/control/leader", get(control::leader))
        .route("/control/health", get(control::health_report))
        .route("/control/debug", put(control::set_debug))
        .route("/control/log/stats", get(control::log_stats))
        .route("/control/log/:index", get(control::log_entry))
        // Peer RPCs
        .route("/raft/request-vote", post(raft::request_vote))
        .route("/raft/append-entries", post(raft::append_entries))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Process liveness. Peers ping this for reachability.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
