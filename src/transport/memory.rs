//! In-process transport for multi-node tests.
//!
//! A [`MemoryNetwork`] is a registry of node handlers plus a set of
//! isolated nodes. Messages to or from an isolated node fail as
//! unreachable, which is how tests model network partitions.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::{RpcHandler, Transport, TransportError};
use crate::raft::log::NodeInfo;
use crate::raft::message::{
    AppendEntries, AppendEntriesResponse, RequestVote, RequestVoteResponse,
};
use crate::raft::NodeId;

/// Shared switchboard for every [`MemoryTransport`] created from it.
#[derive(Default)]
pub struct MemoryNetwork {
    handlers: Mutex<HashMap<NodeId, Weak<dyn RpcHandler>>>,
    isolated: Mutex<HashSet<NodeId>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport that sends as `node_id`.
    pub fn transport(self: &Arc<Self>, node_id: NodeId) -> MemoryTransport {
        MemoryTransport {
            node_id,
            network: Arc::clone(self),
            failing_inits: AtomicU32::new(0),
        }
    }

    /// Cut `node_id` off from every other node.
    pub fn isolate(&self, node_id: NodeId) {
        self.isolated.lock().expect("mutex poisoned").insert(node_id);
    }

    pub fn heal(&self, node_id: NodeId) {
        self.isolated.lock().expect("mutex poisoned").remove(&node_id);
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<dyn RpcHandler>, TransportError> {
        let isolated = self.isolated.lock().expect("mutex poisoned");
        if isolated.contains(&from) || isolated.contains(&to) {
            return Err(TransportError::Unreachable {
                node_id: to,
                reason: "partitioned".into(),
            });
        }
        drop(isolated);
        self.handlers
            .lock()
            .expect("mutex poisoned")
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable {
                node_id: to,
                reason: "no such node".into(),
            })
    }
}

pub struct MemoryTransport {
    node_id: NodeId,
    network: Arc<MemoryNetwork>,
    failing_inits: AtomicU32,
}

impl MemoryTransport {
    /// Make the next `count` calls to `initialize` fail.
    pub fn fail_initializations(&self, count: u32) {
        self.failing_inits.store(count, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn initialize(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let failed = self
            .failing_inits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if failed {
                Err(TransportError::Init("injected initialization failure".into()))
            } else {
                Ok(())
            }
        })
    }

    fn request_vote(
        &self,
        target: &NodeInfo,
        request: RequestVote,
    ) -> Pin<Box<dyn Future<Output = Result<RequestVoteResponse, TransportError>> + Send + '_>>
    {
        let route = self.network.route(self.node_id, target.id);
        let node_id = target.id;
        Box::pin(async move {
            let handler = route?;
            handler
                .handle_request_vote(request)
                .await
                .map_err(|e| TransportError::Remote {
                    node_id,
                    reason: e.to_string(),
                })
        })
    }

    fn append_entries(
        &self,
        target: &NodeInfo,
        request: AppendEntries,
    ) -> Pin<Box<dyn Future<Output = Result<AppendEntriesResponse, TransportError>> + Send + '_>>
    {
        let route = self.network.route(self.node_id, target.id);
        let node_id = target.id;
        Box::pin(async move {
            let handler = route?;
            handler
                .handle_append_entries(request)
                .await
                .map_err(|e| TransportError::Remote {
                    node_id,
                    reason: e.to_string(),
                })
        })
    }

    fn ping(
        &self,
        target: &NodeInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let result = self.network.route(self.node_id, target.id).map(|_| ());
        Box::pin(async move { result })
    }

    fn attach(&self, handler: Weak<dyn RpcHandler>) {
        self.network
            .handlers
            .lock()
            .expect("mutex poisoned")
            .insert(self.node_id, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ClusterError;

    struct Echo;

    impl RpcHandler for Echo {
        fn handle_request_vote(
            &self,
            request: RequestVote,
        ) -> Pin<Box<dyn Future<Output = Result<RequestVoteResponse, ClusterError>> + Send + '_>>
        {
            Box::pin(async move {
                Ok(RequestVoteResponse {
                    term: request.term,
                    vote_granted: true,
                })
            })
        }

        fn handle_append_entries(
            &self,
            request: AppendEntries,
        ) -> Pin<Box<dyn Future<Output = Result<AppendEntriesResponse, ClusterError>> + Send + '_>>
        {
            Box::pin(async move {
                Ok(AppendEntriesResponse {
                    term: request.term,
                    success: true,
                    match_index: request.prev_log_index,
                })
            })
        }
    }

    fn vote(term: u64) -> RequestVote {
        RequestVote {
            term,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
            pre_vote: false,
        }
    }

    #[tokio::test]
    async fn test_routes_to_attached_handler() {
        let net = MemoryNetwork::new();
        let t1 = net.transport(1);
        let t2 = net.transport(2);
        let echo: Arc<dyn RpcHandler> = Arc::new(Echo);
        t2.attach(Arc::downgrade(&echo));

        let target = NodeInfo::new(2, "mem", 0);
        let resp = t1.request_vote(&target, vote(3)).await.unwrap();
        assert!(resp.vote_granted);
        assert_eq!(resp.term, 3);
        t1.ping(&target).await.unwrap();
    }

    #[tokio::test]
    async fn test_isolation_blocks_both_directions() {
        let net = MemoryNetwork::new();
        let t1 = net.transport(1);
        let t2 = net.transport(2);
        let echo: Arc<dyn RpcHandler> = Arc::new(Echo);
        t1.attach(Arc::downgrade(&echo));
        t2.attach(Arc::downgrade(&echo));

        net.isolate(2);
        let to_two = NodeInfo::new(2, "mem", 0);
        let to_one = NodeInfo::new(1, "mem", 0);
        assert!(t1.request_vote(&to_two, vote(1)).await.is_err());
        assert!(t2.ping(&to_one).await.is_err());

        net.heal(2);
        assert!(t1.request_vote(&to_two, vote(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_or_dropped_node_is_unreachable() {
        let net = MemoryNetwork::new();
        let t1 = net.transport(1);
        let t2 = net.transport(2);
        {
            let echo: Arc<dyn RpcHandler> = Arc::new(Echo);
            t2.attach(Arc::downgrade(&echo));
        }
        let err = t1.ping(&NodeInfo::new(2, "mem", 0)).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { node_id: 2, .. }));
        assert!(t1.ping(&NodeInfo::new(9, "mem", 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_initialization_failures() {
        let net = MemoryNetwork::new();
        let t1 = net.transport(1);
        t1.fail_initializations(2);
        assert!(t1.initialize().await.is_err());
        assert!(t1.initialize().await.is_err());
        assert!(t1.initialize().await.is_ok());
    }
}
