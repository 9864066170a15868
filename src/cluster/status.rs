//! Cluster state snapshot returned by the status surface.

use serde::Serialize;
use utoipa::ToSchema;

use crate::metrics::Counters;
use crate::raft::node::RaftView;
use crate::raft::{NodeId, Role, Term};

/// Field order is part of the interface; clients may read it positionally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub current_term: Term,
    pub leader_id: Option<NodeId>,
    pub role: Role,
    pub member_count: usize,
    pub messages_processed: u64,
    pub heartbeats_sent: u64,
    pub elections_triggered: u64,
}

impl ClusterStatus {
    pub fn from_view(view: &RaftView, counters: &Counters) -> Self {
        Self {
            node_id: view.node_id,
            current_term: view.current_term,
            leader_id: view.leader_id,
            role: view.role,
            member_count: view.members.len(),
            messages_processed: counters.messages_processed(),
            heartbeats_sent: counters.heartbeats_sent(),
            elections_triggered: counters.elections_triggered(),
        }
    }
}
