//! Cluster membership.
//!
//! Membership is the configured voting set plus every committed add/remove
//! entry, applied in log order. It changes only when an entry commits, so
//! every node that has applied the same prefix agrees on the voting set.
//! A restarted node rebuilds it by replaying its committed log on top of
//! the configured base.

use std::collections::BTreeMap;

use tracing::info;

use crate::errors::ClusterError;
use crate::raft::consensus::RaftCore;
use crate::raft::log::{EntryPayload, LogEntry, NodeInfo};
use crate::raft::{NodeId, Role};

/// The applied voting set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    members: BTreeMap<NodeId, NodeInfo>,
}

impl Membership {
    /// Base membership: the configured peers, plus `local` when it is part of
    /// the initial voting set.
    pub fn bootstrap(local: &NodeInfo, peers: &[NodeInfo], include_local: bool) -> Self {
        let mut members: BTreeMap<NodeId, NodeInfo> =
            peers.iter().map(|p| (p.id, p.clone())).collect();
        if include_local {
            members.insert(local.id, local.clone());
        }
        Self { members }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeInfo> {
        self.members.get(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Strict majority of the voting set.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    /// Every member except `local`.
    pub fn peers(&self, local: NodeId) -> impl Iterator<Item = &NodeInfo> + '_ {
        self.members.values().filter(move |n| n.id != local)
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.members.values().cloned().collect()
    }

    /// Apply one committed entry. Returns true when the voting set changed.
    pub fn apply(&mut self, entry: &LogEntry) -> bool {
        match &entry.payload {
            EntryPayload::Noop => false,
            EntryPayload::AddNode { node } => {
                if self.members.get(&node.id) == Some(node) {
                    return false;
                }
                info!(
                    index = entry.index,
                    node_id = node.id,
                    address = %node.address,
                    port = node.port,
                    "member added"
                );
                self.members.insert(node.id, node.clone());
                true
            }
            EntryPayload::RemoveNode { node_id } => {
                let removed = self.members.remove(node_id).is_some();
                if removed {
                    info!(index = entry.index, node_id, "member removed");
                }
                removed
            }
        }
    }

    /// Decide what a membership request means against the applied set and
    /// the leader's log. Checked in order: leadership, idempotency and
    /// conflicts, then the one-change-at-a-time rule.
    pub fn plan(
        &self,
        change: &MembershipChange,
        core: &RaftCore,
    ) -> Result<ChangePlan, ClusterError> {
        if core.role() != Role::Leader {
            return Err(ClusterError::NotLeader {
                leader_id: core.leader_id(),
            });
        }

        let payload = match change {
            MembershipChange::Add(node) => match self.members.get(&node.id) {
                Some(existing) if existing == node => return Ok(ChangePlan::AlreadyApplied),
                Some(existing) => {
                    return Err(ClusterError::conflict(format!(
                        "node {} is already a member at {}:{}",
                        existing.id, existing.address, existing.port
                    )))
                }
                None => EntryPayload::AddNode { node: node.clone() },
            },
            MembershipChange::Remove(node_id) => {
                if !self.members.contains_key(node_id) {
                    return Err(ClusterError::conflict(format!(
                        "node {} is not a member",
                        node_id
                    )));
                }
                if *node_id == core.id() {
                    return Ok(ChangePlan::StepDown);
                }
                EntryPayload::RemoveNode { node_id: *node_id }
            }
        };

        if core.has_pending_configuration() {
            return Err(ClusterError::ChangeInProgress);
        }
        Ok(ChangePlan::Propose(payload))
    }
}

/// A requested single-node membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(NodeInfo),
    Remove(NodeId),
}

/// Outcome of [`Membership::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangePlan {
    /// Already reflected in the applied set. Nothing to append.
    AlreadyApplied,
    /// Append this entry and wait for it to commit.
    Propose(EntryPayload),
    /// The leader was asked to remove itself and must hand off first.
    StepDown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::consensus::{RaftCore, RaftTiming};
    use crate::raft::log::HardState;
    use std::time::{Duration, Instant};

    fn node(id: NodeId) -> NodeInfo {
        NodeInfo::new(id, "127.0.0.1", 7000 + id as u16)
    }

    fn three() -> Membership {
        Membership::bootstrap(&node(1), &[node(2), node(3)], true)
    }

    fn timing() -> RaftTiming {
        RaftTiming {
            election_timeout_min: Duration::from_millis(100),
            election_timeout_max: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(20),
            max_append_entries: 16,
        }
    }

    /// A core that has won an election for a three-node cluster.
    fn leader_core(membership: &Membership) -> RaftCore {
        let now = Instant::now();
        let mut core = RaftCore::new(1, timing(), HardState::default(), Vec::new(), 0, now);
        let ready = core.tick(now + Duration::from_secs(1), membership);
        assert!(ready.campaigned);
        let term = core.current_term();
        core.handle_vote_response(
            2,
            term,
            &crate::raft::message::RequestVoteResponse {
                term,
                vote_granted: true,
            },
            now,
            membership,
        );
        assert_eq!(core.role(), Role::Leader);
        core
    }

    #[test]
    fn test_bootstrap_and_quorum() {
        let m = three();
        assert_eq!(m.len(), 3);
        assert_eq!(m.quorum(), 2);
        assert_eq!(m.peers(1).count(), 2);

        let joining = Membership::bootstrap(&node(4), &[node(1), node(2), node(3)], false);
        assert!(!joining.contains(4));
        assert_eq!(joining.quorum(), 2);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut m = three();
        let add = LogEntry {
            index: 2,
            term: 1,
            payload: EntryPayload::AddNode { node: node(4) },
        };
        assert!(m.apply(&add));
        assert!(!m.apply(&add));
        assert_eq!(m.len(), 4);
        assert_eq!(m.quorum(), 3);

        let remove = LogEntry {
            index: 3,
            term: 1,
            payload: EntryPayload::RemoveNode { node_id: 4 },
        };
        assert!(m.apply(&remove));
        assert!(!m.apply(&remove));
        assert_eq!(m, three());
    }

    #[test]
    fn test_plan_requires_leader() {
        let m = three();
        let core = RaftCore::new(
            1,
            timing(),
            HardState::default(),
            Vec::new(),
            0,
            Instant::now(),
        );
        let err = m
            .plan(&MembershipChange::Add(node(4)), &core)
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotLeader { leader_id: None }));
    }

    #[test]
    fn test_plan_add_semantics() {
        let m = three();
        let core = leader_core(&m);

        assert_eq!(
            m.plan(&MembershipChange::Add(node(2)), &core).unwrap(),
            ChangePlan::AlreadyApplied
        );
        let moved = NodeInfo::new(2, "10.9.9.9", 7002);
        assert!(matches!(
            m.plan(&MembershipChange::Add(moved), &core),
            Err(ClusterError::ConfigurationConflict { .. })
        ));
        assert_eq!(
            m.plan(&MembershipChange::Add(node(4)), &core).unwrap(),
            ChangePlan::Propose(EntryPayload::AddNode { node: node(4) })
        );
    }

    #[test]
    fn test_plan_remove_semantics() {
        let m = three();
        let core = leader_core(&m);

        assert!(matches!(
            m.plan(&MembershipChange::Remove(9), &core),
            Err(ClusterError::ConfigurationConflict { .. })
        ));
        assert_eq!(
            m.plan(&MembershipChange::Remove(1), &core).unwrap(),
            ChangePlan::StepDown
        );
        assert_eq!(
            m.plan(&MembershipChange::Remove(3), &core).unwrap(),
            ChangePlan::Propose(EntryPayload::RemoveNode { node_id: 3 })
        );
    }

    #[test]
    fn test_plan_rejects_second_pending_change() {
        let m = three();
        let mut core = leader_core(&m);
        core.propose(EntryPayload::AddNode { node: node(4) }).unwrap();

        assert!(matches!(
            m.plan(&MembershipChange::Add(node(5)), &core),
            Err(ClusterError::ChangeInProgress)
        ));
        // An identical request for an already-applied member still succeeds.
        assert_eq!(
            m.plan(&MembershipChange::Add(node(3)), &core).unwrap(),
            ChangePlan::AlreadyApplied
        );
    }
}
