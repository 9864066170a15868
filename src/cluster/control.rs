//! Status and control surface.
//!
//! [`ClusterController`] is what the HTTP handlers and `main` talk to. It
//! owns node bootstrap (`init`), starts the Raft driver and the health
//! worker, and answers status queries from the published [`RaftView`]
//! without touching the consensus lock.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::health::{HealthReport, HealthWorker, SharedReport};
use super::lifecycle::{Lifecycle, WorkerState};
use super::membership::MembershipChange;
use super::status::ClusterStatus;
use crate::config::{Config, MAX_NODE_ID};
use crate::errors::ClusterError;
use crate::logging::DebugSwitch;
use crate::metrics::{Counters, STORAGE_FAILURES_TOTAL};
use crate::raft::log::{LogEntry, NodeInfo};
use crate::raft::node::{LogStats, RaftNode, RaftView};
use crate::raft::{LogIndex, NodeId, Role};
use crate::storage::store::LogStore;
use crate::transport::{RpcHandler, Transport};

struct Runtime {
    identity: NodeInfo,
    node: Arc<RaftNode>,
}

pub struct ClusterController {
    config: Config,
    store: Arc<dyn LogStore>,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
    lifecycle: Arc<Lifecycle>,
    debug: DebugSwitch,
    report: SharedReport,
    runtime: RwLock<Option<Runtime>>,
    /// Serializes `init` calls so two callers cannot both bootstrap.
    init_lock: tokio::sync::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterController {
    pub fn new(
        config: Config,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn Transport>,
        debug: DebugSwitch,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            transport,
            counters: Arc::new(Counters::default()),
            lifecycle: Arc::new(Lifecycle::default()),
            debug,
            report: Arc::new(RwLock::new(HealthReport::pending())),
            runtime: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    // ── Bootstrap ───────────────────────────────────────────────────

    /// One-time bootstrap. Repeating it with the same identity succeeds
    /// without side effects; a different identity, in memory or in the
    /// store, is a conflict. A storage failure during recovery, such as a
    /// corrupt log, puts the worker in `ERROR`.
    pub async fn init(&self, identity: NodeInfo) -> Result<bool, ClusterError> {
        if identity.id == 0 || identity.id > MAX_NODE_ID {
            return Err(ClusterError::InvalidArgument {
                message: format!("node id must be between 1 and {MAX_NODE_ID}"),
            });
        }
        if identity.address.is_empty() || identity.port == 0 {
            return Err(ClusterError::InvalidArgument {
                message: "address and port are required".to_string(),
            });
        }

        let _guard = self.init_lock.lock().await;
        if let Some(current) = self.identity() {
            if current == identity {
                return Ok(true);
            }
            return Err(ClusterError::conflict(format!(
                "already initialized as node {} at {}:{}",
                current.id, current.address, current.port
            )));
        }
        if let Some(peer) = self.config.cluster.peers.iter().find(|p| p.id == identity.id) {
            if peer.address != identity.address || peer.port != identity.port {
                return Err(ClusterError::conflict(format!(
                    "node {} is configured as a peer at {}:{}",
                    peer.id, peer.address, peer.port
                )));
            }
        }
        let stored = self
            .store
            .load_identity()
            .await
            .map_err(|e| self.escalate(e.into()))?;
        match stored {
            Some(stored) if stored != identity => {
                return Err(ClusterError::conflict(format!(
                    "log store belongs to node {} at {}:{}",
                    stored.id, stored.address, stored.port
                )))
            }
            Some(_) => {}
            None => self
                .store
                .save_identity(identity.clone())
                .await
                .map_err(|e| self.escalate(e.into()))?,
        }

        let node = RaftNode::open(
            identity.clone(),
            &self.config,
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            Arc::clone(&self.counters),
            Arc::clone(&self.lifecycle),
        )
        .await
        .map_err(|e| self.escalate(e))?;
        let handler: Arc<dyn RpcHandler> = node.clone();
        self.transport.attach(Arc::downgrade(&handler));

        let worker = HealthWorker::new(
            Arc::clone(&node),
            Arc::clone(&self.transport),
            Arc::clone(&self.lifecycle),
            self.config.health.clone(),
            self.config.raft.rpc_timeout(),
            Arc::clone(&self.report),
        );
        {
            let mut tasks = self.tasks.lock().expect("mutex poisoned");
            tasks.push(tokio::spawn(
                Arc::clone(&node).run(self.shutdown_tx.subscribe()),
            ));
            tasks.push(tokio::spawn(worker.run(self.shutdown_tx.subscribe())));
        }

        info!(
            node_id = identity.id,
            address = %identity.address,
            port = identity.port,
            cluster = %self.config.cluster.name,
            "node initialized"
        );
        *self.runtime.write().expect("lock poisoned") = Some(Runtime { identity, node });
        Ok(true)
    }

    /// Record a storage failure found before the node could run. The worker
    /// enters `ERROR` and the health report carries the reason.
    pub fn record_storage_failure(&self, failure: &ClusterError) {
        if self.lifecycle.fail() {
            error!(
                code = failure.code(),
                error = %failure,
                "log store unusable; worker entering ERROR"
            );
            counter!(STORAGE_FAILURES_TOTAL).increment(1);
        }
        *self.report.write().expect("lock poisoned") = HealthReport::failed(failure.to_string(), 0);
    }

    fn escalate(&self, e: ClusterError) -> ClusterError {
        if matches!(e, ClusterError::Storage(_)) {
            self.record_storage_failure(&e);
        }
        e
    }

    fn identity(&self) -> Option<NodeInfo> {
        self.runtime
            .read()
            .expect("lock poisoned")
            .as_ref()
            .map(|r| r.identity.clone())
    }

    /// The running node, or `NotInitialized`.
    pub fn node(&self) -> Result<Arc<RaftNode>, ClusterError> {
        self.runtime
            .read()
            .expect("lock poisoned")
            .as_ref()
            .map(|r| Arc::clone(&r.node))
            .ok_or(ClusterError::NotInitialized)
    }

    fn view(&self) -> Option<RaftView> {
        self.node().ok().map(|n| n.view())
    }

    // ── Membership ──────────────────────────────────────────────────

    /// Add a voting member. Succeeds once the change has committed; an
    /// identical repeat is a no-op.
    pub async fn add_node(&self, node: NodeInfo) -> Result<(), ClusterError> {
        if node.id == 0 || node.id > MAX_NODE_ID {
            return Err(ClusterError::InvalidArgument {
                message: format!("node id must be between 1 and {MAX_NODE_ID}"),
            });
        }
        self.node()?
            .change_membership(MembershipChange::Add(node))
            .await
    }

    pub async fn remove_node(&self, node_id: NodeId) -> Result<(), ClusterError> {
        self.node()?
            .change_membership(MembershipChange::Remove(node_id))
            .await
    }

    pub fn nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        Ok(self.node()?.view().members)
    }

    // ── Status ──────────────────────────────────────────────────────

    /// Always succeeds. Before `init` every field is zero.
    pub fn get_cluster_status(&self) -> ClusterStatus {
        match self.view() {
            Some(view) => ClusterStatus::from_view(&view, &self.counters),
            None => ClusterStatus::default(),
        }
    }

    pub fn get_worker_state(&self) -> WorkerState {
        self.lifecycle.get()
    }

    /// `RUNNING` and a leader heard from within two heartbeat intervals.
    pub fn is_healthy(&self) -> bool {
        if self.lifecycle.get() != WorkerState::Running {
            return false;
        }
        let window = self.config.raft.heartbeat_interval() * 2;
        self.view()
            .and_then(|v| v.leader_id.and(v.last_leader_contact))
            .map_or(false, |t| Instant::now().saturating_duration_since(t) <= window)
    }

    pub fn is_leader(&self) -> bool {
        self.view().map_or(false, |v| v.role == Role::Leader)
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.view().and_then(|v| v.leader_id)
    }

    pub fn health_report(&self) -> HealthReport {
        self.report.read().expect("lock poisoned").clone()
    }

    // ── Diagnostics ─────────────────────────────────────────────────

    /// Toggle debug logging. Never touches consensus state.
    pub fn set_debug(&self, enabled: bool) -> bool {
        self.debug.set(enabled);
        true
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.is_enabled()
    }

    pub async fn log_entry(&self, index: LogIndex) -> Result<LogEntry, ClusterError> {
        if index == 0 {
            return Err(ClusterError::InvalidArgument {
                message: "log indices start at 1".to_string(),
            });
        }
        self.node()?
            .log_entry(index)
            .await?
            .ok_or_else(|| ClusterError::NotFound {
                message: format!("no log entry at index {index}"),
            })
    }

    pub fn log_stats(&self) -> Result<LogStats, ClusterError> {
        Ok(self.node()?.log_stats())
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Stop the background tasks and close the store.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().expect("mutex poisoned").drain(..).collect();
        let grace = Duration::from_secs(self.config.server.shutdown_timeout);
        for task in tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("background task did not stop within the shutdown timeout");
            }
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "failed to close the log store");
        }
        info!("cluster controller stopped");
    }
}
