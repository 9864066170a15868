//! Cluster error types.
//!
//! Every variant maps to a stable error code and an HTTP status. The enum
//! implements [`axum::response::IntoResponse`] so control handlers can
//! simply return `Err(ClusterError::NotLeader { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::raft::{LogIndex, NodeId};
use crate::storage::store::StorageError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// Malformed or stale-term peer message. Discarded by the receiver.
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// The follower's log does not contain the leader's previous entry.
    #[error("log does not match the leader at index {index}")]
    LogInconsistency { index: LogIndex },

    /// A durable write or read failed. The node stops participating.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Message delivery failed. Never changes local role.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Conflicting identity or membership request.
    #[error("{message}")]
    ConfigurationConflict { message: String },

    /// The node has no identity yet; call `init` first.
    #[error("node is not initialized")]
    NotInitialized,

    /// Only the leader accepts membership changes.
    #[error("this node is not the leader")]
    NotLeader { leader_id: Option<NodeId> },

    /// An earlier membership change has not committed yet.
    #[error("a membership change is already in progress")]
    ChangeInProgress,

    /// The leader was asked to remove itself. It stepped down instead; retry
    /// against the next leader.
    #[error("node {node_id} stepped down; retry the removal against the new leader")]
    StepDownDeferred { node_id: NodeId },

    /// The proposal did not commit in time. Safe to retry.
    #[error("timed out waiting for the change to commit")]
    Timeout,

    #[error("{message}")]
    InvalidArgument { message: String },

    #[error("{message}")]
    NotFound { message: String },

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClusterError {
    pub fn conflict(message: impl Into<String>) -> Self {
        ClusterError::ConfigurationConflict {
            message: message.into(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::Protocol { .. } => "ProtocolError",
            ClusterError::LogInconsistency { .. } => "LogInconsistency",
            ClusterError::Storage(_) => "StorageFailure",
            ClusterError::Transport(_) => "TransportFailure",
            ClusterError::ConfigurationConflict { .. } => "ConfigurationConflict",
            ClusterError::NotInitialized => "NotInitialized",
            ClusterError::NotLeader { .. } => "NotLeader",
            ClusterError::ChangeInProgress => "ChangeInProgress",
            ClusterError::StepDownDeferred { .. } => "StepDownDeferred",
            ClusterError::Timeout => "Timeout",
            ClusterError::InvalidArgument { .. } => "InvalidArgument",
            ClusterError::NotFound { .. } => "NotFound",
            ClusterError::Internal(_) => "InternalError",
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::Protocol { .. } => StatusCode::BAD_REQUEST,
            ClusterError::LogInconsistency { .. } => StatusCode::CONFLICT,
            ClusterError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterError::Transport(_) => StatusCode::BAD_GATEWAY,
            ClusterError::ConfigurationConflict { .. } => StatusCode::CONFLICT,
            ClusterError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            ClusterError::ChangeInProgress => StatusCode::CONFLICT,
            ClusterError::StepDownDeferred { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ClusterError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            ClusterError::NotFound { .. } => StatusCode::NOT_FOUND,
            ClusterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn leader_hint(&self) -> Option<NodeId> {
        match self {
            ClusterError::NotLeader { leader_id } => *leader_id,
            _ => None,
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<NodeId>,
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "request failed");
        }
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            leader_id: self.leader_hint(),
        };
        (status, Json(body)).into_response()
    }
}
