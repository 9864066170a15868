//! Replicated log entries and the durable per-node records.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{LogIndex, NodeId, Term};

/// Addressable cluster member. Its role is derived from Raft state and is
/// never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
}

impl NodeInfo {
    pub fn new(id: NodeId, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
        }
    }

    /// Base URL of the node's HTTP surface.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// What a log entry asks the cluster to do once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    /// Appended by every new leader so earlier entries can commit.
    Noop,
    AddNode { node: NodeInfo },
    RemoveNode { node_id: NodeId },
}

impl EntryPayload {
    /// True for entries that change cluster membership.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, EntryPayload::Noop)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub payload: EntryPayload,
}

/// Term and vote, persisted before any vote is granted or requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_wire_format() {
        let entry = LogEntry {
            index: 3,
            term: 2,
            payload: EntryPayload::AddNode {
                node: NodeInfo::new(4, "10.0.0.4", 7004),
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["payload"]["type"], "add_node");
        assert_eq!(json["payload"]["node"]["port"], 7004);

        let noop: EntryPayload = serde_json::from_str(r#"{"type":"noop"}"#).unwrap();
        assert_eq!(noop, EntryPayload::Noop);
        assert!(!noop.is_configuration());
        assert!(EntryPayload::RemoveNode { node_id: 2 }.is_configuration());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(
            NodeInfo::new(1, "127.0.0.1", 7001).base_url(),
            "http://127.0.0.1:7001"
        );
    }
}
