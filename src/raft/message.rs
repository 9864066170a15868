//! Peer-to-peer RPC messages.
//!
//! Any recipient that observes a greater term in a request or response
//! adopts it and reverts to follower before acting on the message. The one
//! exception is a pre-vote: it asks whether a vote *would* be granted and
//! changes no state on either side.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::log::LogEntry;
use super::{LogIndex, NodeId, Term};
use crate::errors::ClusterError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RequestVote {
    /// For a pre-vote, the term the candidate would campaign in.
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    #[serde(default)]
    pub pre_vote: bool,
}

impl RequestVote {
    /// Reject requests no correct candidate sends.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.candidate_id == 0 || self.term == 0 {
            return Err(ClusterError::Protocol {
                message: format!(
                    "vote request with candidate {} and term {}",
                    self.candidate_id, self.term
                ),
            });
        }
        if self.last_log_term > self.term {
            return Err(ClusterError::Protocol {
                message: format!(
                    "candidate {} claims last log term {} beyond its term {}",
                    self.candidate_id, self.last_log_term, self.term
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

impl AppendEntries {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries must continue `prev_log_index` without gaps and carry terms
    /// no newer than the leader's.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.leader_id == 0 || self.term == 0 {
            return Err(ClusterError::Protocol {
                message: format!(
                    "append from leader {} in term {}",
                    self.leader_id, self.term
                ),
            });
        }
        for (offset, entry) in self.entries.iter().enumerate() {
            let expected = self.prev_log_index + 1 + offset as u64;
            if entry.index != expected {
                return Err(ClusterError::Protocol {
                    message: format!(
                        "non-contiguous append from leader {}: expected index {expected}, got {}",
                        self.leader_id, entry.index
                    ),
                });
            }
            if entry.term > self.term {
                return Err(ClusterError::Protocol {
                    message: format!(
                        "entry {} carries term {} beyond the leader's term {}",
                        entry.index, entry.term, self.term
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Reply to [`AppendEntries`]. On success `match_index` is the last index
/// known to match the leader; on failure it is a back-off hint no greater
/// than `prev_log_index - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
}
