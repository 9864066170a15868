//! Raft consensus: wire messages, the pure state machine, and the async
//! driver that connects it to storage and transport.

pub mod consensus;
pub mod log;
pub mod message;
pub mod node;

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Cluster-unique node identifier.
pub type NodeId = u64;

/// Election term. Never decreases on a node.
pub type Term = u64;

/// 1-based position in the replicated log. Index 0 means "before the log".
pub type LogIndex = u64;

/// A node's role in the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
