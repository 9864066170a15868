//! The Raft driver.
//!
//! [`RaftNode`] wraps a [`RaftCore`] and the applied [`Membership`] in one
//! mutex and connects them to storage, the transport and the clock. The
//! lock is never held across an `.await`: handlers take it, compute, drop
//! it, then do I/O.
//!
//! Every durable write goes through `write_permit`, a tokio mutex. The
//! permit is what orders "persist the vote" before "reply granted", and
//! "append to disk" before "acknowledge". Whoever holds it always writes
//! the latest hard state, so a concurrent newer term supersedes an older
//! one that was never written.
//!
//! Outbound RPCs run on spawned tasks. Their responses come back over a
//! channel to [`RaftNode::run`], which feeds them into the core in arrival
//! order alongside timer ticks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use super::consensus::{AppendDecision, Outbound, RaftCore, RaftTiming, Ready};
use super::log::{EntryPayload, LogEntry, NodeInfo};
use super::message::{AppendEntries, AppendEntriesResponse, RequestVote, RequestVoteResponse};
use super::{LogIndex, NodeId, Role, Term};
use crate::cluster::lifecycle::Lifecycle;
use crate::cluster::membership::{ChangePlan, Membership, MembershipChange};
use crate::config::Config;
use crate::errors::ClusterError;
use crate::metrics::{Counters, RAFT_COMMIT_INDEX, RAFT_IS_LEADER, RAFT_TERM, STORAGE_FAILURES_TOTAL};
use crate::storage::store::{LogStore, StorageError};
use crate::transport::{RpcHandler, Transport, TransportError};

/// Immutable snapshot published after every state change. Readers never
/// touch the consensus lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaftView {
    pub node_id: NodeId,
    pub current_term: Term,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub members: Vec<NodeInfo>,
    pub last_leader_contact: Option<Instant>,
    pub storage_failed: bool,
    pub pending_config: bool,
}

impl RaftView {
    fn capture(core: &RaftCore, membership: &Membership) -> Self {
        Self {
            node_id: core.id(),
            current_term: core.current_term(),
            role: core.role(),
            leader_id: core.leader_id(),
            commit_index: core.commit_index(),
            last_applied: core.last_applied(),
            last_log_index: core.last_index(),
            last_log_term: core.last_term(),
            members: membership.nodes(),
            last_leader_contact: core.last_leader_contact(),
            storage_failed: core.is_disabled(),
            pending_config: core.has_pending_configuration(),
        }
    }

    pub fn is_member(&self) -> bool {
        self.members.iter().any(|m| m.id == self.node_id)
    }
}

/// Log summary for the introspection endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LogStats {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub pending_config: bool,
}

struct Consensus {
    core: RaftCore,
    membership: Membership,
}

enum RpcReply {
    Vote {
        from: NodeId,
        term: Term,
        pre_vote: bool,
        response: RequestVoteResponse,
    },
    Append {
        from: NodeId,
        term: Term,
        response: AppendEntriesResponse,
    },
}

pub struct RaftNode {
    id: NodeId,
    tick_interval: Duration,
    rpc_timeout: Duration,
    proposal_timeout: Duration,
    state: Mutex<Consensus>,
    write_permit: tokio::sync::Mutex<()>,
    persisted_commit: AtomicU64,
    store: Arc<dyn LogStore>,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
    lifecycle: Arc<Lifecycle>,
    view_tx: watch::Sender<RaftView>,
    reply_tx: mpsc::UnboundedSender<RpcReply>,
    replies: Mutex<Option<mpsc::UnboundedReceiver<RpcReply>>>,
}

impl RaftNode {
    /// Recover a node from `store`. The stored log is verified, the hard
    /// state and commit index restored, and the membership rebuilt by
    /// replaying committed entries over the configured base.
    pub async fn open(
        local: NodeInfo,
        config: &Config,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn Transport>,
        counters: Arc<Counters>,
        lifecycle: Arc<Lifecycle>,
    ) -> Result<Arc<Self>, ClusterError> {
        store.verify().await?;
        let hard_state = store.load_hard_state().await?;
        let (last_index, _) = store.last_index_and_term().await?;
        let log = if last_index == 0 {
            Vec::new()
        } else {
            store.entries_from(1, last_index as usize).await?
        };
        let commit_index = store.commit_index().await?;

        let peers: Vec<NodeInfo> = config
            .cluster
            .peers
            .iter()
            .filter(|p| p.id != local.id)
            .map(NodeInfo::from)
            .collect();
        let mut membership = Membership::bootstrap(&local, &peers, config.cluster.bootstrap);

        let mut core = RaftCore::new(
            local.id,
            RaftTiming::from(&config.raft),
            hard_state,
            log,
            commit_index,
            Instant::now(),
        );
        for entry in core.take_committed() {
            membership.apply(&entry);
        }
        info!(
            node_id = local.id,
            term = core.current_term(),
            last_index,
            commit_index = core.commit_index(),
            members = membership.len(),
            "raft state recovered"
        );

        let view = RaftView::capture(&core, &membership);
        let (view_tx, _) = watch::channel(view);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            id: local.id,
            tick_interval: config.raft.tick_interval(),
            rpc_timeout: config.raft.rpc_timeout(),
            proposal_timeout: config.raft.proposal_timeout(),
            state: Mutex::new(Consensus { core, membership }),
            write_permit: tokio::sync::Mutex::new(()),
            persisted_commit: AtomicU64::new(commit_index),
            store,
            transport,
            counters,
            lifecycle,
            view_tx,
            reply_tx,
            replies: Mutex::new(Some(reply_rx)),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Latest published snapshot.
    pub fn view(&self) -> RaftView {
        self.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftView> {
        self.view_tx.subscribe()
    }

    // ── Driver loop ─────────────────────────────────────────────────

    /// Advance timers and process RPC responses until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let receiver = self.replies.lock().expect("mutex poisoned").take();
        let Some(mut replies) = receiver else {
            warn!(node_id = self.id, "raft driver is already running");
            return;
        };
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(node_id = self.id, "raft driver started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                Some(reply) = replies.recv() => self.on_reply(reply).await,
                _ = shutdown.changed() => break,
            }
        }
        debug!(node_id = self.id, "raft driver stopped");
    }

    async fn on_tick(self: &Arc<Self>) {
        let ready = self.step(|core, membership| core.tick(Instant::now(), membership));
        self.process_ready(ready).await;
        self.persist_commit().await;
        self.publish();
    }

    async fn on_reply(self: &Arc<Self>, reply: RpcReply) {
        self.counters.message_processed();
        let now = Instant::now();
        let ready = self.step(|core, membership| match reply {
            RpcReply::Vote {
                from,
                term,
                pre_vote: true,
                response,
            } => core.handle_pre_vote_response(from, term, &response, now, membership),
            RpcReply::Vote {
                from,
                term,
                pre_vote: false,
                response,
            } => core.handle_vote_response(from, term, &response, now, membership),
            RpcReply::Append {
                from,
                term,
                response,
            } => core.handle_append_response(from, term, &response, now, membership),
        });
        self.process_ready(ready).await;
        self.persist_commit().await;
        self.publish();
    }

    /// Persist any hard-state change, then send. A newly elected leader
    /// appends its no-op so entries from earlier terms can commit.
    async fn process_ready(self: &Arc<Self>, ready: Ready) {
        if ready.campaigned {
            self.counters.election_triggered();
        }
        {
            let _permit = self.write_permit.lock().await;
            if self.save_hard_state_locked().await.is_err() {
                return;
            }
        }
        self.dispatch(ready.messages);

        if ready.became_leader {
            let _permit = self.write_permit.lock().await;
            if let Err(e) = self.propose_locked(EntryPayload::Noop).await {
                debug!(node_id = self.id, error = %e, "leader no-op not appended");
            }
        }
    }

    /// Run `f` against the core, then apply whatever became committed.
    fn step<R>(&self, f: impl FnOnce(&mut RaftCore, &Membership) -> R) -> R {
        let mut state = self.state.lock().expect("mutex poisoned");
        let Consensus { core, membership } = &mut *state;
        let result = f(core, membership);
        for entry in core.take_committed() {
            membership.apply(&entry);
        }
        result
    }

    fn dispatch(self: &Arc<Self>, messages: Vec<Outbound>) {
        if messages.is_empty() {
            return;
        }
        let routed: Vec<(NodeInfo, Outbound)> = {
            let state = self.state.lock().expect("mutex poisoned");
            messages
                .into_iter()
                .filter_map(|m| state.membership.get(m.to()).cloned().map(|t| (t, m)))
                .collect()
        };
        for (target, message) in routed {
            let node = Arc::clone(self);
            tokio::spawn(async move { node.send(target, message).await });
        }
    }

    async fn send(&self, target: NodeInfo, message: Outbound) {
        let reply = match message {
            Outbound::Vote { request, .. } => {
                let term = request.term;
                let pre_vote = request.pre_vote;
                let call = self.transport.request_vote(&target, request);
                self.deliver(&target, call).await.map(|response| RpcReply::Vote {
                    from: target.id,
                    term,
                    pre_vote,
                    response,
                })
            }
            Outbound::Append { request, .. } => {
                let term = request.term;
                if request.is_heartbeat() {
                    self.counters.heartbeat_sent();
                }
                let call = self.transport.append_entries(&target, request);
                self.deliver(&target, call).await.map(|response| RpcReply::Append {
                    from: target.id,
                    term,
                    response,
                })
            }
        };
        if let Some(reply) = reply {
            // The driver only goes away at shutdown.
            let _ = self.reply_tx.send(reply);
        }
    }

    /// Await one RPC under the RPC timeout. Failures count as lost messages.
    async fn deliver<T>(
        &self,
        target: &NodeInfo,
        call: impl std::future::Future<Output = Result<T, TransportError>>,
    ) -> Option<T> {
        match timeout(self.rpc_timeout, call).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(e)) => {
                debug!(peer = target.id, error = %e, "rpc failed");
                None
            }
            Err(_) => {
                debug!(peer = target.id, "rpc timed out");
                None
            }
        }
    }

    // ── Inbound RPCs ────────────────────────────────────────────────

    /// Malformed messages never reach the core.
    fn check_message(&self, checked: Result<(), ClusterError>) -> Result<(), ClusterError> {
        if let Err(e) = &checked {
            debug!(
                node_id = self.id,
                code = e.code(),
                error = %e,
                "discarding malformed peer message"
            );
        }
        checked
    }

    pub async fn on_request_vote(
        &self,
        request: RequestVote,
    ) -> Result<RequestVoteResponse, ClusterError> {
        self.counters.message_processed();
        self.check_message(request.validate())?;
        let permit = self.write_permit.lock().await;
        let response = {
            let mut state = self.state.lock().expect("mutex poisoned");
            if state.core.is_disabled() {
                return Err(StorageError::Fenced.into());
            }
            let Consensus { core, membership } = &mut *state;
            core.request_vote(&request, membership, Instant::now())
        };
        self.save_hard_state_locked().await?;
        drop(permit);
        self.publish();
        Ok(response)
    }

    pub async fn on_append_entries(
        &self,
        request: AppendEntries,
    ) -> Result<AppendEntriesResponse, ClusterError> {
        self.counters.message_processed();
        self.check_message(request.validate())?;
        let response = {
            let _permit = self.write_permit.lock().await;
            let decision = {
                if self.state.lock().expect("mutex poisoned").core.is_disabled() {
                    return Err(StorageError::Fenced.into());
                }
                self.step(|core, _| core.prepare_append(&request, Instant::now()))
            };
            self.save_hard_state_locked().await?;
            match decision {
                AppendDecision::Reply(response) => response,
                AppendDecision::Write(plan) => {
                    if let Some(after) = plan.truncate_after {
                        warn!(
                            node_id = self.id,
                            after,
                            leader = request.leader_id,
                            "truncating conflicting log suffix"
                        );
                        self.store
                            .truncate_after(after)
                            .await
                            .map_err(|e| self.fail_storage(e))?;
                    }
                    self.store
                        .append(plan.entries.clone())
                        .await
                        .map_err(|e| self.fail_storage(e))?;
                    self.step(|core, _| core.apply_append(plan))
                }
            }
        };
        self.persist_commit().await;
        self.publish();
        Ok(response)
    }

    // ── Membership changes ──────────────────────────────────────────

    /// Propose a single-node membership change on the leader and wait until
    /// it commits and is applied here.
    pub async fn change_membership(
        self: &Arc<Self>,
        change: MembershipChange,
    ) -> Result<(), ClusterError> {
        let entry = {
            let _permit = self.write_permit.lock().await;
            let plan = {
                let state = self.state.lock().expect("mutex poisoned");
                if state.core.is_disabled() {
                    return Err(StorageError::Fenced.into());
                }
                state.membership.plan(&change, &state.core)?
            };
            match plan {
                ChangePlan::AlreadyApplied => {
                    info!(node_id = self.id, ?change, "membership change already applied");
                    return Ok(());
                }
                ChangePlan::StepDown => {
                    self.step(|core, _| core.step_down(Instant::now()));
                    self.publish();
                    warn!(
                        node_id = self.id,
                        "asked to remove the current leader; stepped down instead"
                    );
                    return Err(ClusterError::StepDownDeferred { node_id: self.id });
                }
                ChangePlan::Propose(payload) => self.propose_locked(payload).await?,
            }
        };
        info!(
            node_id = self.id,
            index = entry.index,
            term = entry.term,
            ?change,
            "membership change proposed"
        );
        self.persist_commit().await;
        self.publish();
        self.await_commit(entry.index, entry.term).await
    }

    /// Append `payload` to the local log and start replicating it. The
    /// caller holds the write permit.
    async fn propose_locked(self: &Arc<Self>, payload: EntryPayload) -> Result<LogEntry, ClusterError> {
        let entry = self.step(|core, _| core.propose(payload))?;
        self.store
            .append(vec![entry.clone()])
            .await
            .map_err(|e| self.fail_storage(e))?;
        let messages = self.step(|core, membership| {
            core.entries_persisted(entry.index, membership);
            core.replicate(membership)
        });
        self.dispatch(messages);
        Ok(entry)
    }

    async fn await_commit(&self, index: LogIndex, term: Term) -> Result<(), ClusterError> {
        let mut views = self.view_tx.subscribe();
        let waited = timeout(
            self.proposal_timeout,
            views.wait_for(|v| v.last_applied >= index || v.current_term != term || v.storage_failed),
        )
        .await;
        match waited {
            Err(_) => return Err(ClusterError::Timeout),
            Ok(Err(_)) => {
                return Err(ClusterError::Internal(anyhow::anyhow!(
                    "raft state channel closed"
                )))
            }
            Ok(Ok(view)) => drop(view),
        }

        let state = self.state.lock().expect("mutex poisoned");
        if state.core.is_disabled() {
            return Err(StorageError::Fenced.into());
        }
        if state.core.last_applied() >= index && state.core.term_at(index) == Some(term) {
            Ok(())
        } else {
            Err(ClusterError::NotLeader {
                leader_id: state.core.leader_id(),
            })
        }
    }

    // ── Persistence helpers ─────────────────────────────────────────

    /// Write the hard state if it changed. The caller holds the permit.
    async fn save_hard_state_locked(&self) -> Result<(), ClusterError> {
        let pending = self
            .state
            .lock()
            .expect("mutex poisoned")
            .core
            .take_hard_state();
        if let Some(hard_state) = pending {
            self.store
                .save_hard_state(hard_state)
                .await
                .map_err(|e| self.fail_storage(e))?;
        }
        Ok(())
    }

    async fn persist_commit(&self) {
        let commit = self.state.lock().expect("mutex poisoned").core.commit_index();
        if commit <= self.persisted_commit.load(Ordering::SeqCst) {
            return;
        }
        let _permit = self.write_permit.lock().await;
        match self.store.set_commit_index(commit).await {
            Ok(()) => {
                self.persisted_commit.fetch_max(commit, Ordering::SeqCst);
            }
            Err(e) => {
                self.fail_storage(e);
            }
        }
    }

    /// Fence the node after a storage failure: it stops voting,
    /// acknowledging and campaigning, and the worker enters `ERROR`.
    fn fail_storage(&self, e: StorageError) -> ClusterError {
        let first = {
            let mut state = self.state.lock().expect("mutex poisoned");
            let first = !state.core.is_disabled();
            state.core.disable();
            first
        };
        if first {
            error!(node_id = self.id, error = %e, "storage failure; node leaves consensus");
            counter!(STORAGE_FAILURES_TOTAL).increment(1);
            self.lifecycle.fail();
        }
        self.publish();
        ClusterError::Storage(e)
    }

    fn publish(&self) {
        let view = {
            let state = self.state.lock().expect("mutex poisoned");
            RaftView::capture(&state.core, &state.membership)
        };
        gauge!(RAFT_TERM).set(view.current_term as f64);
        gauge!(RAFT_COMMIT_INDEX).set(view.commit_index as f64);
        gauge!(RAFT_IS_LEADER).set(if view.role == Role::Leader { 1.0 } else { 0.0 });
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    // ── Introspection ───────────────────────────────────────────────

    pub async fn log_entry(&self, index: LogIndex) -> Result<Option<LogEntry>, ClusterError> {
        Ok(self.store.entry_at(index).await?)
    }

    pub fn log_stats(&self) -> LogStats {
        let state = self.state.lock().expect("mutex poisoned");
        let core = &state.core;
        LogStats {
            last_index: core.last_index(),
            last_term: core.last_term(),
            commit_index: core.commit_index(),
            last_applied: core.last_applied(),
            current_term: core.current_term(),
            voted_for: core.voted_for(),
            pending_config: core.has_pending_configuration(),
        }
    }
}

impl RpcHandler for RaftNode {
    fn handle_request_vote(
        &self,
        request: RequestVote,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<RequestVoteResponse, ClusterError>> + Send + '_>,
    > {
        Box::pin(self.on_request_vote(request))
    }

    fn handle_append_entries(
        &self,
        request: AppendEntries,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<AppendEntriesResponse, ClusterError>> + Send + '_>,
    > {
        Box::pin(self.on_append_entries(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::raft::log::HardState;
    use crate::storage::memory::MemoryLogStore;
    use crate::transport::memory::MemoryNetwork;

    fn single_node_config() -> Config {
        let mut config = Config::default();
        config.raft.election_timeout_min_ms = 50;
        config.raft.election_timeout_max_ms = 80;
        config.raft.heartbeat_interval_ms = 10;
        config.raft.tick_interval_ms = 5;
        config.raft.proposal_timeout_ms = 1000;
        config
    }

    fn local() -> NodeInfo {
        NodeInfo::new(1, "127.0.0.1", 7001)
    }

    async fn open(config: &Config, store: Arc<MemoryLogStore>) -> Arc<RaftNode> {
        let network = MemoryNetwork::new();
        RaftNode::open(
            local(),
            config,
            store,
            Arc::new(network.transport(1)),
            Arc::new(Counters::default()),
            Arc::new(Lifecycle::default()),
        )
        .await
        .unwrap()
    }

    async fn wait_until(node: &RaftNode, f: impl FnMut(&RaftView) -> bool) {
        let mut views = node.subscribe();
        tokio::time::timeout(Duration::from_secs(5), views.wait_for(f))
            .await
            .expect("condition not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_node_elects_and_commits_noop() {
        let config = single_node_config();
        let store = Arc::new(MemoryLogStore::new());
        let node = open(&config, Arc::clone(&store)).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = tokio::spawn(Arc::clone(&node).run(stop_rx));

        wait_until(&node, |v| v.role == Role::Leader && v.commit_index >= 1).await;
        let entry = node.log_entry(1).await.unwrap().unwrap();
        assert_eq!(entry.payload, EntryPayload::Noop);
        assert_eq!(store.load_hard_state().await.unwrap().voted_for, Some(1));

        stop_tx.send(true).unwrap();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_replays_committed_membership() {
        let config = single_node_config();
        let store = Arc::new(MemoryLogStore::new());
        let joined = NodeInfo::new(2, "127.0.0.1", 7002);
        store
            .append(vec![
                LogEntry {
                    index: 1,
                    term: 1,
                    payload: EntryPayload::Noop,
                },
                LogEntry {
                    index: 2,
                    term: 1,
                    payload: EntryPayload::AddNode {
                        node: joined.clone(),
                    },
                },
            ])
            .await
            .unwrap();
        store
            .save_hard_state(HardState {
                current_term: 1,
                voted_for: Some(1),
            })
            .await
            .unwrap();
        store.set_commit_index(2).await.unwrap();

        let node = open(&config, store).await;
        let view = node.view();
        assert_eq!(view.current_term, 1);
        assert_eq!(view.commit_index, 2);
        assert_eq!(view.last_applied, 2);
        assert_eq!(view.members, vec![local(), joined]);
        assert_eq!(view.role, Role::Follower);
    }

    #[tokio::test]
    async fn test_append_is_durable_before_ack() {
        let mut config = single_node_config();
        config.cluster.peers = vec![PeerConfig {
            id: 2,
            address: "127.0.0.1".into(),
            port: 7002,
        }];
        let store = Arc::new(MemoryLogStore::new());
        let node = open(&config, Arc::clone(&store)).await;

        let response = node
            .on_append_entries(AppendEntries {
                term: 3,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry {
                    index: 1,
                    term: 3,
                    payload: EntryPayload::Noop,
                }],
                leader_commit: 1,
            })
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(store.last_index_and_term().await.unwrap(), (1, 3));
        assert_eq!(store.load_hard_state().await.unwrap().current_term, 3);
        assert_eq!(store.commit_index().await.unwrap(), 1);
        assert_eq!(node.view().leader_id, Some(2));
    }

    #[tokio::test]
    async fn test_write_failure_fences_node() {
        let mut config = single_node_config();
        config.cluster.peers = vec![PeerConfig {
            id: 2,
            address: "127.0.0.1".into(),
            port: 7002,
        }];
        let store = Arc::new(MemoryLogStore::new());
        let node = open(&config, Arc::clone(&store)).await;
        store.set_fail_writes(true);

        let vote = RequestVote {
            term: 5,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
            pre_vote: false,
        };
        let err = node.on_request_vote(vote.clone()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Storage(_)));
        assert!(node.view().storage_failed);
        assert_eq!(node.lifecycle.get(), crate::cluster::lifecycle::WorkerState::Error);

        // Fenced from now on, even once writes work again.
        store.set_fail_writes(false);
        assert!(node.on_request_vote(vote).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_messages_are_discarded() {
        let mut config = single_node_config();
        config.cluster.peers = vec![PeerConfig {
            id: 2,
            address: "127.0.0.1".into(),
            port: 7002,
        }];
        let store = Arc::new(MemoryLogStore::new());
        let node = open(&config, Arc::clone(&store)).await;

        let err = node
            .on_append_entries(AppendEntries {
                term: 3,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry {
                    index: 2,
                    term: 3,
                    payload: EntryPayload::Noop,
                }],
                leader_commit: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Protocol { .. }));
        // Neither the term nor the log moved.
        assert_eq!(store.load_hard_state().await.unwrap().current_term, 0);
        assert_eq!(store.last_index_and_term().await.unwrap(), (0, 0));
        assert_eq!(node.view().leader_id, None);

        let err = node
            .on_request_vote(RequestVote {
                term: 0,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
                pre_vote: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ProtocolError");
    }

    #[tokio::test]
    async fn test_pre_vote_is_not_persisted() {
        let mut config = single_node_config();
        config.cluster.peers = vec![PeerConfig {
            id: 2,
            address: "127.0.0.1".into(),
            port: 7002,
        }];
        let store = Arc::new(MemoryLogStore::new());
        let node = open(&config, Arc::clone(&store)).await;

        let response = node
            .on_request_vote(RequestVote {
                term: 4,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
                pre_vote: true,
            })
            .await
            .unwrap();
        assert!(response.vote_granted);
        assert_eq!(response.term, 4);
        assert_eq!(store.load_hard_state().await.unwrap(), HardState::default());
        assert_eq!(node.view().current_term, 0);
    }

    #[tokio::test]
    async fn test_membership_change_requires_leader() {
        let config = single_node_config();
        let node = open(&config, Arc::new(MemoryLogStore::new())).await;
        let err = node
            .change_membership(MembershipChange::Add(NodeInfo::new(2, "127.0.0.1", 7002)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotLeader { leader_id: None }));
    }

    #[tokio::test]
    async fn test_single_node_membership_change_commits() {
        let config = single_node_config();
        let node = open(&config, Arc::new(MemoryLogStore::new())).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = tokio::spawn(Arc::clone(&node).run(stop_rx));
        wait_until(&node, |v| v.role == Role::Leader).await;

        // The add commits on the single-member quorum.
        let joined = NodeInfo::new(2, "127.0.0.1", 7002);
        node.change_membership(MembershipChange::Add(joined))
            .await
            .unwrap();
        assert_eq!(node.view().members.len(), 2);

        // Peer 2 never answers, so its removal cannot reach a quorum of two.
        let err = node
            .change_membership(MembershipChange::Remove(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Timeout | ClusterError::NotLeader { .. }
        ));

        stop_tx.send(true).unwrap();
        driver.await.unwrap();
    }
}
