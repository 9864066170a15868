//! Multi-node behaviour over the in-memory network.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cluster::control::ClusterController;
use crate::cluster::lifecycle::WorkerState;
use crate::config::{Config, PeerConfig};
use crate::errors::ClusterError;
use crate::logging::DebugSwitch;
use crate::raft::log::{EntryPayload, NodeInfo};
use crate::raft::{NodeId, Role, Term};
use crate::storage::memory::MemoryLogStore;
use crate::storage::store::LogStore;
use crate::transport::memory::MemoryNetwork;
use crate::transport::Transport;

fn info(id: NodeId) -> NodeInfo {
    NodeInfo::new(id, "127.0.0.1", 7000 + id as u16)
}

fn config(election_ms: (u64, u64), bootstrap: bool) -> Config {
    let mut config = Config::default();
    config.cluster.peers = (1..=3)
        .map(|id| PeerConfig {
            id,
            address: "127.0.0.1".to_string(),
            port: 7000 + id as u16,
        })
        .collect();
    config.cluster.bootstrap = bootstrap;
    config.raft.election_timeout_min_ms = election_ms.0;
    config.raft.election_timeout_max_ms = election_ms.1;
    config.raft.heartbeat_interval_ms = 25;
    config.raft.tick_interval_ms = 5;
    config.raft.rpc_timeout_ms = 100;
    config.raft.proposal_timeout_ms = 2000;
    config.health.worker_interval_ms = 20;
    config.health.primary_failure_timeout_ms = 300;
    config.server.shutdown_timeout = 2;
    config
}

struct TestNode {
    controller: Arc<ClusterController>,
    store: Arc<MemoryLogStore>,
}

struct TestCluster {
    network: Arc<MemoryNetwork>,
    nodes: BTreeMap<NodeId, TestNode>,
    /// Every (term, leader) pair any node ever published.
    leaders_seen: Arc<Mutex<BTreeMap<Term, BTreeSet<NodeId>>>>,
}

impl TestCluster {
    /// Nodes 1-3. Node 1 has the shortest election timeout, so it wins the
    /// first election.
    async fn start() -> Self {
        Self::start_with(|id| if id == 1 { (150, 200) } else { (600, 900) }).await
    }

    async fn start_with(timing: impl Fn(NodeId) -> (u64, u64)) -> Self {
        let mut cluster = Self {
            network: MemoryNetwork::new(),
            nodes: BTreeMap::new(),
            leaders_seen: Arc::new(Mutex::new(BTreeMap::new())),
        };
        for id in 1..=3 {
            cluster.add(id, config(timing(id), true)).await;
        }
        cluster
    }

    async fn add(&mut self, id: NodeId, config: Config) {
        let transport: Arc<dyn Transport> = Arc::new(self.network.transport(id));
        let store = Arc::new(MemoryLogStore::new());
        let controller = Arc::new(ClusterController::new(
            config,
            store.clone(),
            transport,
            DebugSwitch::detached(false),
        ));
        controller.init(info(id)).await.unwrap();

        let mut views = controller.node().unwrap().subscribe();
        let seen = Arc::clone(&self.leaders_seen);
        tokio::spawn(async move {
            loop {
                {
                    let view = views.borrow_and_update();
                    if view.role == Role::Leader {
                        seen.lock()
                            .unwrap()
                            .entry(view.current_term)
                            .or_default()
                            .insert(view.node_id);
                    }
                }
                if views.changed().await.is_err() {
                    break;
                }
            }
        });
        self.nodes.insert(id, TestNode { controller, store });
    }

    fn controller(&self, id: NodeId) -> &Arc<ClusterController> {
        &self.nodes[&id].controller
    }

    /// Leaders among nodes not in `excluded`.
    fn leaders(&self, excluded: &[NodeId]) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(id, n)| !excluded.contains(*id) && n.controller.is_leader())
            .map(|(id, _)| *id)
            .collect()
    }

    fn assert_one_leader_per_term(&self) {
        for (term, leaders) in self.leaders_seen.lock().unwrap().iter() {
            assert!(
                leaders.len() <= 1,
                "term {term} had leaders {leaders:?}"
            );
        }
    }

    async fn shutdown(self) {
        self.assert_one_leader_per_term();
        for node in self.nodes.values() {
            node.controller.shutdown().await;
        }
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn elect_node_one(cluster: &TestCluster) {
    eventually("node 1 to lead", || {
        cluster
            .nodes
            .values()
            .all(|n| n.controller.leader() == Some(1))
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initial_election() {
    let cluster = TestCluster::start().await;
    elect_node_one(&cluster).await;
    assert_eq!(cluster.leaders(&[]), vec![1]);

    eventually("all nodes healthy", || {
        cluster.nodes.values().all(|n| n.controller.is_healthy())
    })
    .await;
    for id in 1..=3 {
        let status = cluster.controller(id).get_cluster_status();
        assert_eq!(status.node_id, id);
        assert_eq!(status.member_count, 3);
        assert_eq!(status.leader_id, Some(1));
        assert!(status.messages_processed > 0);
        assert_eq!(cluster.controller(id).get_worker_state(), WorkerState::Running);
    }
    assert!(cluster.controller(1).get_cluster_status().heartbeats_sent > 0);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failover_after_leader_partition() {
    let cluster = TestCluster::start().await;
    elect_node_one(&cluster).await;
    let first_term = cluster.controller(1).get_cluster_status().current_term;
    eventually("the first no-op to commit everywhere", || {
        cluster
            .nodes
            .values()
            .all(|n| n.controller.log_stats().unwrap().commit_index >= 1)
    })
    .await;

    // Cut the leader off and hand it a proposal nobody else will see.
    cluster.network.isolate(1);
    let stale_index = cluster.controller(1).log_stats().unwrap().last_index + 1;
    let isolated = Arc::clone(cluster.controller(1));
    let stale = tokio::spawn(async move { isolated.add_node(info(9)).await });
    eventually("node 1 to append the stale proposal", || {
        cluster.controller(1).log_stats().unwrap().last_index >= stale_index
    })
    .await;
    let stale_entry = cluster.controller(1).log_entry(stale_index).await.unwrap();
    assert_eq!(stale_entry.term, first_term);
    assert!(matches!(&stale_entry.payload, EntryPayload::AddNode { node } if node.id == 9));

    eventually("a new leader among 2 and 3", || {
        cluster.leaders(&[1]).len() == 1
    })
    .await;
    let new_leader = cluster.leaders(&[1])[0];
    let new_term = cluster.controller(new_leader).get_cluster_status().current_term;
    assert!(new_term > first_term);

    // The isolated leader gives up once it loses contact with a majority,
    // and its proposal never commits.
    eventually("node 1 to step down", || !cluster.controller(1).is_leader()).await;
    let outcome = stale.await.unwrap();
    assert!(matches!(
        outcome,
        Err(ClusterError::Timeout | ClusterError::NotLeader { .. })
    ));
    // Polling while alone never raised node 1's term.
    assert_eq!(cluster.controller(1).get_cluster_status().current_term, first_term);

    cluster.network.heal(1);
    eventually("node 1 to follow the new leader", || {
        cluster
            .nodes
            .values()
            .all(|n| n.controller.leader() == Some(new_leader))
    })
    .await;

    // Give node 1 several election timeouts to misbehave. The new leader
    // keeps its term and its leadership.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(cluster.leaders(&[]), vec![new_leader]);
    for id in 1..=3 {
        assert_eq!(cluster.controller(id).get_cluster_status().current_term, new_term);
    }

    let leader_commit = cluster.controller(new_leader).log_stats().unwrap().commit_index;
    assert!(leader_commit >= stale_index);
    eventually("node 1 to catch up", || {
        cluster.controller(1).log_stats().unwrap().commit_index >= leader_commit
    })
    .await;

    // The stale entry was overwritten, and every committed index holds the
    // same entry on every node.
    let replaced = cluster.controller(1).log_entry(stale_index).await.unwrap();
    assert_ne!(replaced, stale_entry);
    assert_eq!(replaced.term, new_term);
    for index in 1..=leader_commit {
        let expected = cluster.nodes[&new_leader].store.entry_at(index).await.unwrap();
        assert!(expected.is_some());
        for id in 1..=3 {
            let actual = cluster.nodes[&id].store.entry_at(index).await.unwrap();
            assert_eq!(actual, expected, "node {id} differs at index {index}");
        }
    }
    for id in 1..=3 {
        assert_eq!(cluster.controller(id).get_cluster_status().member_count, 3);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_membership_add_and_storage_failure() {
    let mut cluster = TestCluster::start().await;
    elect_node_one(&cluster).await;

    // Node 4 starts outside the voting set and learns about itself through
    // the replicated log.
    cluster.add(4, config((600, 900), false)).await;
    assert_eq!(cluster.controller(4).get_cluster_status().member_count, 3);

    cluster.controller(1).add_node(info(4)).await.unwrap();
    eventually("every node to see four members", || {
        cluster
            .nodes
            .values()
            .all(|n| n.controller.get_cluster_status().member_count == 4)
    })
    .await;

    // Repeating the add is a no-op.
    let before = cluster.controller(1).log_stats().unwrap().last_index;
    cluster.controller(1).add_node(info(4)).await.unwrap();
    assert_eq!(cluster.controller(1).log_stats().unwrap().last_index, before);
    assert_eq!(cluster.controller(1).nodes().unwrap().len(), 4);

    // Same id, different address.
    let err = cluster
        .controller(1)
        .add_node(NodeInfo::new(4, "127.0.0.2", 7004))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::ConfigurationConflict { .. }));

    // Followers reject and point at the leader without touching their log.
    let follower_last = cluster.controller(2).log_stats().unwrap().last_index;
    let err = cluster
        .controller(2)
        .add_node(info(5))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::NotLeader { leader_id: Some(1) }));
    assert_eq!(cluster.controller(2).log_stats().unwrap().last_index, follower_last);

    // Node 2 loses its disk. It drops out while the rest keep committing.
    cluster.nodes[&2].store.set_fail_writes(true);
    cluster.controller(1).remove_node(4).await.unwrap();
    eventually("node 2 to enter ERROR", || {
        cluster.controller(2).get_worker_state() == WorkerState::Error
    })
    .await;
    assert!(!cluster.controller(2).is_healthy());
    eventually("nodes 1 and 3 to see three members", || {
        [1, 3]
            .iter()
            .all(|&id| cluster.controller(id).get_cluster_status().member_count == 3)
    })
    .await;
    assert_eq!(cluster.leaders(&[]), vec![1]);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_self_removal_hands_off() {
    let cluster = TestCluster::start_with(|_| (300, 600)).await;
    eventually("a leader", || cluster.leaders(&[]).len() == 1).await;
    let old = cluster.leaders(&[])[0];

    let err = cluster.controller(old).remove_node(old).await.unwrap_err();
    assert!(matches!(err, ClusterError::StepDownDeferred { node_id } if node_id == old));

    eventually("a different leader", || {
        let leaders = cluster.leaders(&[]);
        leaders.len() == 1 && leaders[0] != old
    })
    .await;
    let new = cluster.leaders(&[])[0];
    cluster.controller(new).remove_node(old).await.unwrap();
    let term = cluster.controller(new).get_cluster_status().current_term;

    // The removed node may keep polling for votes, but remaining members
    // refuse to follow it or adopt its term.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cluster.leaders(&[old]), vec![new]);
    assert_eq!(cluster.controller(new).get_cluster_status().current_term, term);
    assert_eq!(cluster.controller(new).get_cluster_status().member_count, 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_transport_init_failure_enters_error() {
    let network = MemoryNetwork::new();
    let transport = Arc::new(network.transport(1));
    transport.fail_initializations(10);

    let mut config = config((150, 200), true);
    config.health.transport_init_attempts = 2;
    config.health.transport_init_backoff_ms = 1;
    let controller = ClusterController::new(
        config,
        Arc::new(MemoryLogStore::new()),
        transport,
        DebugSwitch::detached(false),
    );
    controller.init(info(1)).await.unwrap();
    eventually("worker ERROR", || {
        controller.get_worker_state() == WorkerState::Error
    })
    .await;
    assert!(!controller.is_healthy());
    let report = controller.health_report();
    assert!(report.errors[0].starts_with("transport failure"));
    controller.shutdown().await;
}
