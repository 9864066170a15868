//! Control-plane handlers under `/control`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::cluster::health::HealthReport;
use crate::cluster::lifecycle::WorkerState;
use crate::cluster::status::ClusterStatus;
use crate::config::MAX_NODE_ID;
use crate::errors::ClusterError;
use crate::raft::log::{LogEntry, NodeInfo};
use crate::raft::node::LogStats;
use crate::raft::{LogIndex, NodeId};
use crate::AppState;

// -- Request and response bodies ----------------------------------------------

/// Identity of a node, used by `init` and add-node.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema, Validate)]
pub struct NodeRequest {
    #[garde(range(min = 1, max = MAX_NODE_ID))]
    pub node_id: NodeId,
    #[garde(length(min = 1, max = 255))]
    pub address: String,
    #[garde(range(min = 1))]
    pub port: u16,
}

impl NodeRequest {
    fn into_node(self) -> Result<NodeInfo, ClusterError> {
        self.validate().map_err(|report| ClusterError::InvalidArgument {
            message: report.to_string(),
        })?;
        Ok(NodeInfo::new(self.node_id, self.address, self.port))
    }
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct DebugRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InitResponse {
    pub initialized: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChangeResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WorkerStateResponse {
    pub state: WorkerState,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthyResponse {
    pub healthy: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LeaderResponse {
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DebugResponse {
    pub ok: bool,
    pub debug: bool,
}

// -- Bootstrap ----------------------------------------------------------------

/// `POST /control/init` -- One-time node bootstrap.
#[utoipa::path(
    post,
    path = "/control/init",
    tag = "Control",
    operation_id = "Init",
    request_body = NodeRequest,
    responses(
        (status = 200, description = "Node initialized", body = InitResponse),
        (status = 400, description = "Invalid identity"),
        (status = 409, description = "Already initialized with a different identity")
    )
)]
pub async fn init(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NodeRequest>,
) -> Result<Json<InitResponse>, ClusterError> {
    let node = request.into_node()?;
    let initialized = state.controller.init(node).await?;
    Ok(Json(InitResponse { initialized }))
}

// -- Membership ---------------------------------------------------------------

/// `GET /control/nodes` -- Applied voting members.
#[utoipa::path(
    get,
    path = "/control/nodes",
    tag = "Control",
    operation_id = "ListNodes",
    responses(
        (status = 200, description = "Members", body = Vec<NodeInfo>),
        (status = 503, description = "Not initialized")
    )
)]
pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<NodeInfo>>, ClusterError> {
    Ok(Json(state.controller.nodes()?))
}

/// `POST /control/nodes` -- Add a voting member. Returns after commit.
#[utoipa::path(
    post,
    path = "/control/nodes",
    tag = "Control",
    operation_id = "AddNode",
    request_body = NodeRequest,
    responses(
        (status = 200, description = "Committed", body = ChangeResponse),
        (status = 409, description = "Conflicting member or change in progress"),
        (status = 421, description = "Not the leader; body carries leader_id"),
        (status = 504, description = "Did not commit in time")
    )
)]
pub async fn add_node(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NodeRequest>,
) -> Result<Json<ChangeResponse>, ClusterError> {
    let node = request.into_node()?;
    state.controller.add_node(node).await?;
    Ok(Json(ChangeResponse { accepted: true }))
}

/// `DELETE /control/nodes/{id}` -- Remove a voting member.
#[utoipa::path(
    delete,
    path = "/control/nodes/{id}",
    tag = "Control",
    operation_id = "RemoveNode",
    params(("id" = u64, Path, description = "Node id")),
    responses(
        (status = 200, description = "Committed", body = ChangeResponse),
        (status = 409, description = "Not a member or change in progress"),
        (status = 421, description = "Not the leader"),
        (status = 503, description = "Leader stepped down; retry against the new leader")
    )
)]
pub async fn remove_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<NodeId>,
) -> Result<Json<ChangeResponse>, ClusterError> {
    state.controller.remove_node(id).await?;
    Ok(Json(ChangeResponse { accepted: true }))
}

// -- Status -------------------------------------------------------------------

/// `GET /control/status` -- Cluster state snapshot. Always succeeds.
#[utoipa::path(
    get,
    path = "/control/status",
    tag = "Status",
    operation_id = "GetClusterStatus",
    responses((status = 200, description = "Snapshot", body = ClusterStatus))
)]
pub async fn status(State(state): State<Arc<AppState>>) -> Json<ClusterStatus> {
    Json(state.controller.get_cluster_status())
}

/// `GET /control/worker-state`
#[utoipa::path(
    get,
    path = "/control/worker-state",
    tag = "Status",
    operation_id = "GetWorkerState",
    responses((status = 200, description = "INIT, RUNNING or ERROR", body = WorkerStateResponse))
)]
pub async fn worker_state(State(state): State<Arc<AppState>>) -> Json<WorkerStateResponse> {
    Json(WorkerStateResponse {
        state: state.controller.get_worker_state(),
    })
}

/// `GET /control/healthy`
#[utoipa::path(
    get,
    path = "/control/healthy",
    tag = "Status",
    operation_id = "IsHealthy",
    responses((status = 200, description = "Health flag", body = HealthyResponse))
)]
pub async fn healthy(State(state): State<Arc<AppState>>) -> Json<HealthyResponse> {
    Json(HealthyResponse {
        healthy: state.controller.is_healthy(),
    })
}

/// `GET /control/leader`
#[utoipa::path(
    get,
    path = "/control/leader",
    tag = "Status",
    operation_id = "IsLeader",
    responses((status = 200, description = "Leadership", body = LeaderResponse))
)]
pub async fn leader(State(state): State<Arc<AppState>>) -> Json<LeaderResponse> {
    Json(LeaderResponse {
        is_leader: state.controller.is_leader(),
        leader_id: state.controller.leader(),
    })
}

/// `GET /control/health` -- Latest health worker report.
#[utoipa::path(
    get,
    path = "/control/health",
    tag = "Status",
    operation_id = "GetHealthReport",
    responses((status = 200, description = "Report", body = HealthReport))
)]
pub async fn health_report(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.controller.health_report())
}

// -- Diagnostics --------------------------------------------------------------

/// `PUT /control/debug` -- Toggle debug logging.
#[utoipa::path(
    put,
    path = "/control/debug",
    tag = "Diagnostics",
    operation_id = "SetDebug",
    request_body = DebugRequest,
    responses((status = 200, description = "Applied", body = DebugResponse))
)]
pub async fn set_debug(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DebugRequest>,
) -> Json<DebugResponse> {
    let ok = state.controller.set_debug(request.enabled);
    Json(DebugResponse {
        ok,
        debug: state.controller.debug_enabled(),
    })
}

/// `GET /control/log/stats`
#[utoipa::path(
    get,
    path = "/control/log/stats",
    tag = "Diagnostics",
    operation_id = "GetLogStats",
    responses(
        (status = 200, description = "Log summary", body = LogStats),
        (status = 503, description = "Not initialized")
    )
)]
pub async fn log_stats(State(state): State<Arc<AppState>>) -> Result<Json<LogStats>, ClusterError> {
    Ok(Json(state.controller.log_stats()?))
}

/// `GET /control/log/{index}`
#[utoipa::path(
    get,
    path = "/control/log/{index}",
    tag = "Diagnostics",
    operation_id = "GetLogEntry",
    params(("index" = u64, Path, description = "1-based log index")),
    responses(
        (status = 200, description = "Entry", body = LogEntry),
        (status = 404, description = "No entry at that index")
    )
)]
pub async fn log_entry(
    State(state): State<Arc<AppState>>,
    Path(index): Path<LogIndex>,
) -> Result<Json<LogEntry>, ClusterError> {
    Ok(Json(state.controller.log_entry(index).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(node_id: NodeId, address: &str, port: u16) -> NodeRequest {
        NodeRequest {
            node_id,
            address: address.to_string(),
            port,
        }
    }

    #[test]
    fn test_node_request_validation() {
        assert!(request(1, "127.0.0.1", 7001).into_node().is_ok());
        assert!(request(MAX_NODE_ID, "127.0.0.1", 7001).into_node().is_ok());
        for bad in [
            request(0, "127.0.0.1", 7001),
            request(MAX_NODE_ID + 1, "127.0.0.1", 7001),
            request(1, "", 7001),
            request(1, "127.0.0.1", 0),
        ] {
            assert!(matches!(
                bad.into_node(),
                Err(ClusterError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn test_worker_state_body() {
        let body = serde_json::to_string(&WorkerStateResponse {
            state: WorkerState::Init,
        })
        .unwrap();
        assert_eq!(body, r#"{"state":"INIT"}"#);
    }
}
