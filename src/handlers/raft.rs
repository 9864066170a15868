//! Peer RPC endpoints under `/raft`.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::errors::ClusterError;
use crate::raft::message::{AppendEntries, AppendEntriesResponse, RequestVote, RequestVoteResponse};
use crate::AppState;

/// `POST /raft/request-vote`
#[utoipa::path(
    post,
    path = "/raft/request-vote",
    tag = "Raft",
    operation_id = "RequestVote",
    request_body = RequestVote,
    responses(
        (status = 200, description = "Vote decision", body = RequestVoteResponse),
        (status = 500, description = "Storage failure; node is fenced"),
        (status = 503, description = "Not initialized")
    )
)]
pub async fn request_vote(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RequestVote>,
) -> Result<Json<RequestVoteResponse>, ClusterError> {
    let node = state.controller.node()?;
    Ok(Json(node.on_request_vote(request).await?))
}

/// `POST /raft/append-entries`
#[utoipa::path(
    post,
    path = "/raft/append-entries",
    tag = "Raft",
    operation_id = "AppendEntries",
    request_body = AppendEntries,
    responses(
        (status = 200, description = "Append result", body = AppendEntriesResponse),
        (status = 500, description = "Storage failure; node is fenced"),
        (status = 503, description = "Not initialized")
    )
)]
pub async fn append_entries(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AppendEntries>,
) -> Result<Json<AppendEntriesResponse>, ClusterError> {
    let node = state.controller.node()?;
    Ok(Json(node.on_append_entries(request).await?))
}
