//! The Raft state machine.
//!
//! [`RaftCore`] is synchronous and performs no I/O. Time is passed in, and
//! every outbound message is returned in a [`Ready`] for the driver to send.
//! The driver owns durability: it persists the hard state reported by
//! [`RaftCore::take_hard_state`] before sending votes or replies, and calls
//! [`RaftCore::apply_append`] only after the planned write is on disk.
//!
//! Safety rules enforced here:
//! - one vote per term, only for candidates whose log is at least as up to
//!   date as ours;
//! - a node polls its peers with a pre-vote before raising its term, and
//!   members that heard from a live leader within the minimum election
//!   timeout refuse the poll, so a node returning from a partition cannot
//!   depose a healthy leader;
//! - a follower appends only entries that extend a matching prefix, and
//!   never truncates below its commit index;
//! - the leader commits an index only when a strict majority of the current
//!   voting set stores it and the entry belongs to the leader's own term.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use super::log::{EntryPayload, HardState, LogEntry};
use super::message::{AppendEntries, AppendEntriesResponse, RequestVote, RequestVoteResponse};
use super::{LogIndex, NodeId, Role, Term};
use crate::cluster::membership::Membership;
use crate::config::RaftConfig;
use crate::errors::ClusterError;

/// Timing and batching knobs, derived from [`RaftConfig`].
#[derive(Debug, Clone)]
pub struct RaftTiming {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub max_append_entries: usize,
}

impl From<&RaftConfig> for RaftTiming {
    fn from(config: &RaftConfig) -> Self {
        Self {
            election_timeout_min: Duration::from_millis(config.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(config.election_timeout_max_ms),
            heartbeat_interval: config.heartbeat_interval(),
            max_append_entries: config.max_append_entries,
        }
    }
}

/// A message the driver must deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Vote { to: NodeId, request: RequestVote },
    Append { to: NodeId, request: AppendEntries },
}

impl Outbound {
    pub fn to(&self) -> NodeId {
        match self {
            Outbound::Vote { to, .. } | Outbound::Append { to, .. } => *to,
        }
    }
}

/// Work produced by a state transition.
#[derive(Debug, Default)]
pub struct Ready {
    pub messages: Vec<Outbound>,
    /// A new campaign started; the term and self-vote must be persisted
    /// before the vote requests go out.
    pub campaigned: bool,
    /// This node just won an election and should append its no-op entry.
    pub became_leader: bool,
}

/// Outcome of [`RaftCore::prepare_append`].
#[derive(Debug)]
pub enum AppendDecision {
    /// Answer immediately; nothing needs to be written.
    Reply(AppendEntriesResponse),
    /// Write the plan durably, then finish with [`RaftCore::apply_append`].
    Write(AppendPlan),
}

/// Log mutation a follower must make durable before acknowledging.
#[derive(Debug, Clone)]
pub struct AppendPlan {
    /// Term the request was accepted in.
    pub term: Term,
    /// Delete every entry after this index first.
    pub truncate_after: Option<LogIndex>,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
    /// Index of the last entry the request covered.
    pub last_new_index: LogIndex,
}

#[derive(Debug)]
struct LeaderState {
    next_index: BTreeMap<NodeId, LogIndex>,
    match_index: BTreeMap<NodeId, LogIndex>,
    last_contact: BTreeMap<NodeId, Instant>,
    since: Instant,
    last_broadcast: Instant,
}

pub struct RaftCore {
    id: NodeId,
    timing: RaftTiming,
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    /// In-memory copy of the log; `log[i]` holds index `i + 1`.
    log: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    /// Highest index known to be on this node's disk.
    durable_index: LogIndex,
    election_deadline: Instant,
    votes: BTreeSet<NodeId>,
    /// Grants collected by the pre-vote in flight, for `current_term + 1`.
    pre_votes: Option<BTreeSet<NodeId>>,
    leader: Option<LeaderState>,
    last_leader_contact: Option<Instant>,
    hold_off_until: Option<Instant>,
    hard_state_dirty: bool,
    disabled: bool,
}

impl RaftCore {
    /// Restore a node from its persisted hard state and log. Every node
    /// starts as a follower.
    pub fn new(
        id: NodeId,
        timing: RaftTiming,
        hard_state: HardState,
        log: Vec<LogEntry>,
        commit_index: LogIndex,
        now: Instant,
    ) -> Self {
        let durable_index = log.last().map_or(0, |e| e.index);
        let mut core = Self {
            id,
            timing,
            role: Role::Follower,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            leader_id: None,
            log,
            commit_index: commit_index.min(durable_index),
            last_applied: 0,
            durable_index,
            election_deadline: now,
            votes: BTreeSet::new(),
            pre_votes: None,
            leader: None,
            last_leader_contact: None,
            hold_off_until: None,
            hard_state_dirty: false,
            disabled: false,
        };
        core.reset_election_timer(now);
        core
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn last_index(&self) -> LogIndex {
        self.log.last().map_or(0, |e| e.index)
    }

    pub fn last_term(&self) -> Term {
        self.log.last().map_or(0, |e| e.term)
    }

    pub fn last_leader_contact(&self) -> Option<Instant> {
        self.last_leader_contact
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    /// Term of the entry at `index`. Index 0 has term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.log.get((index - 1) as usize).map(|e| e.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// True while an add/remove entry sits above the commit index.
    pub fn has_pending_configuration(&self) -> bool {
        self.log
            .iter()
            .skip(self.commit_index as usize)
            .any(|e| e.payload.is_configuration())
    }

    /// The hard state if it changed since the last call.
    pub fn take_hard_state(&mut self) -> Option<HardState> {
        if self.hard_state_dirty {
            self.hard_state_dirty = false;
            Some(self.hard_state())
        } else {
            None
        }
    }

    // ── Timers and role changes ─────────────────────────────────────

    fn random_election_timeout(&self) -> Duration {
        let min = self.timing.election_timeout_min.as_millis() as u64;
        let max = self.timing.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min)))
    }

    fn reset_election_timer(&mut self, now: Instant) {
        self.election_deadline = now + self.random_election_timeout();
    }

    /// Adopt `term` if it is newer and revert to follower.
    fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.hard_state_dirty = true;
        }
        if self.role != Role::Follower {
            info!(
                node_id = self.id,
                term = self.current_term,
                from = %self.role,
                "reverting to follower"
            );
        }
        self.role = Role::Follower;
        self.leader = None;
        self.votes.clear();
        self.pre_votes = None;
        self.leader_id = leader_id;
    }

    /// Poll peers before campaigning. Nothing is persisted and the term is
    /// unchanged until a majority says it would vote for us.
    fn start_pre_vote(&mut self, now: Instant, membership: &Membership, ready: &mut Ready) {
        self.reset_election_timer(now);
        let granted = BTreeSet::from([self.id]);
        if granted.len() >= membership.quorum() {
            self.start_election(now, membership, ready);
            return;
        }
        self.pre_votes = Some(granted);
        debug!(
            node_id = self.id,
            term = self.current_term,
            "election timeout elapsed; polling peers"
        );
        let request = RequestVote {
            term: self.current_term + 1,
            candidate_id: self.id,
            last_log_index: self.last_index(),
            last_log_term: self.last_term(),
            pre_vote: true,
        };
        for peer in membership.peers(self.id) {
            ready.messages.push(Outbound::Vote {
                to: peer.id,
                request: request.clone(),
            });
        }
    }

    fn start_election(&mut self, now: Instant, membership: &Membership, ready: &mut Ready) {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.hard_state_dirty = true;
        self.role = Role::Candidate;
        self.leader_id = None;
        self.leader = None;
        self.pre_votes = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.reset_election_timer(now);
        ready.campaigned = true;
        info!(node_id = self.id, term = self.current_term, "starting campaign");

        if self.votes.len() >= membership.quorum() {
            self.become_leader(now, membership, ready);
            return;
        }
        let request = RequestVote {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_index(),
            last_log_term: self.last_term(),
            pre_vote: false,
        };
        for peer in membership.peers(self.id) {
            ready.messages.push(Outbound::Vote {
                to: peer.id,
                request: request.clone(),
            });
        }
    }

    fn become_leader(&mut self, now: Instant, membership: &Membership, ready: &mut Ready) {
        info!(node_id = self.id, term = self.current_term, "won election");
        let next = self.last_index() + 1;
        let peers: Vec<NodeId> = membership.peers(self.id).map(|p| p.id).collect();
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.last_leader_contact = Some(now);
        self.hold_off_until = None;
        self.leader = Some(LeaderState {
            next_index: peers.iter().map(|&p| (p, next)).collect(),
            match_index: peers.iter().map(|&p| (p, 0)).collect(),
            last_contact: BTreeMap::new(),
            since: now,
            last_broadcast: now,
        });
        ready.became_leader = true;
        ready.messages.extend(self.replicate(membership));
    }

    /// Leave leadership without a term change and refuse to campaign for two
    /// maximum election periods, so another member takes over.
    pub fn step_down(&mut self, now: Instant) {
        if self.role == Role::Leader {
            info!(node_id = self.id, term = self.current_term, "stepping down");
        }
        self.role = Role::Follower;
        self.leader = None;
        self.leader_id = None;
        self.votes.clear();
        self.pre_votes = None;
        self.hold_off_until = Some(now + self.timing.election_timeout_max * 2);
        self.reset_election_timer(now);
    }

    /// Stop participating after a storage failure. A disabled node never
    /// grants votes, acknowledges appends or campaigns.
    pub fn disable(&mut self) {
        self.disabled = true;
        self.role = Role::Follower;
        self.leader = None;
        self.leader_id = None;
        self.votes.clear();
        self.pre_votes = None;
    }

    // ── Periodic work ───────────────────────────────────────────────

    /// Advance timers. Followers and candidates poll for a campaign once
    /// their randomized deadline passes; leaders send heartbeats and give
    /// up leadership when they lose contact with a majority.
    pub fn tick(&mut self, now: Instant, membership: &Membership) -> Ready {
        let mut ready = Ready::default();
        if self.disabled {
            return ready;
        }

        if self.role == Role::Leader {
            if self.lost_quorum(now, membership) {
                warn!(
                    node_id = self.id,
                    term = self.current_term,
                    "lost contact with a majority; stepping down"
                );
                self.role = Role::Follower;
                self.leader = None;
                self.leader_id = None;
                self.reset_election_timer(now);
                return ready;
            }
            self.last_leader_contact = Some(now);
            let due = self
                .leader
                .as_ref()
                .map_or(false, |l| now >= l.last_broadcast + self.timing.heartbeat_interval);
            if due {
                if let Some(leader) = self.leader.as_mut() {
                    leader.last_broadcast = now;
                }
                ready.messages = self.replicate(membership);
            }
            return ready;
        }

        if now < self.election_deadline {
            return ready;
        }
        if !membership.contains(self.id) {
            self.reset_election_timer(now);
            return ready;
        }
        if let Some(until) = self.hold_off_until {
            if now < until {
                self.reset_election_timer(now);
                return ready;
            }
            self.hold_off_until = None;
        }
        self.start_pre_vote(now, membership, &mut ready);
        ready
    }

    /// True while a leader has been heard from within the minimum election
    /// timeout. A leader counts its own ticks.
    fn heard_from_leader(&self, now: Instant) -> bool {
        self.leader_id.is_some()
            && self.last_leader_contact.map_or(false, |t| {
                now.saturating_duration_since(t) < self.timing.election_timeout_min
            })
    }

    fn log_up_to_date(&self, request: &RequestVote) -> bool {
        (request.last_log_term, request.last_log_index) >= (self.last_term(), self.last_index())
    }

    /// Stale-term messages are protocol-normal: drop them and note why.
    fn log_discard(&self, error: ClusterError) {
        debug!(
            node_id = self.id,
            term = self.current_term,
            code = error.code(),
            error = %error,
            "discarding peer message"
        );
    }

    fn lost_quorum(&self, now: Instant, membership: &Membership) -> bool {
        let Some(leader) = &self.leader else {
            return false;
        };
        let window = self.timing.election_timeout_max;
        if now.saturating_duration_since(leader.since) < window {
            return false;
        }
        let recent = membership
            .peers(self.id)
            .filter(|p| {
                leader
                    .last_contact
                    .get(&p.id)
                    .map_or(false, |&t| now.saturating_duration_since(t) < window)
            })
            .count();
        let own = usize::from(membership.contains(self.id));
        recent + own < membership.quorum()
    }

    // ── RequestVote ─────────────────────────────────────────────────

    /// Handle a vote or pre-vote request. Candidates outside the voting set
    /// are refused without adopting their term, so a removed node cannot
    /// disrupt the cluster.
    pub fn request_vote(
        &mut self,
        request: &RequestVote,
        membership: &Membership,
        now: Instant,
    ) -> RequestVoteResponse {
        let refuse = |term| RequestVoteResponse {
            term,
            vote_granted: false,
        };
        if self.disabled {
            return refuse(self.current_term);
        }
        if !membership.contains(request.candidate_id) {
            debug!(
                candidate = request.candidate_id,
                "ignoring vote request from non-member"
            );
            return refuse(self.current_term);
        }
        if request.pre_vote {
            return self.pre_vote(request, now);
        }
        if request.term < self.current_term {
            self.log_discard(ClusterError::Protocol {
                message: format!(
                    "vote request from {} for term {} behind term {}",
                    request.candidate_id, request.term, self.current_term
                ),
            });
            return refuse(self.current_term);
        }
        if request.term > self.current_term {
            self.become_follower(request.term, None);
        }

        let up_to_date = self.log_up_to_date(request);
        let free = self
            .voted_for
            .map_or(true, |v| v == request.candidate_id);
        if !(up_to_date && free) {
            debug!(
                candidate = request.candidate_id,
                term = self.current_term,
                up_to_date,
                voted_for = ?self.voted_for,
                "vote refused"
            );
            return refuse(self.current_term);
        }

        if self.voted_for.is_none() {
            self.voted_for = Some(request.candidate_id);
            self.hard_state_dirty = true;
        }
        self.reset_election_timer(now);
        debug!(
            candidate = request.candidate_id,
            term = self.current_term,
            "vote granted"
        );
        RequestVoteResponse {
            term: self.current_term,
            vote_granted: true,
        }
    }

    /// Answer a pre-vote without touching any state: grant it only for a
    /// later term, an up-to-date log and no live leader in sight.
    fn pre_vote(&self, request: &RequestVote, now: Instant) -> RequestVoteResponse {
        let refuse = RequestVoteResponse {
            term: self.current_term,
            vote_granted: false,
        };
        if request.term <= self.current_term {
            self.log_discard(ClusterError::Protocol {
                message: format!(
                    "pre-vote from {} for term {} is not ahead of term {}",
                    request.candidate_id, request.term, self.current_term
                ),
            });
            return refuse;
        }
        if self.heard_from_leader(now) {
            debug!(
                candidate = request.candidate_id,
                leader = ?self.leader_id,
                "pre-vote refused; leader is alive"
            );
            return refuse;
        }
        if !self.log_up_to_date(request) {
            debug!(candidate = request.candidate_id, "pre-vote refused; log is behind");
            return refuse;
        }
        debug!(
            candidate = request.candidate_id,
            term = request.term,
            "pre-vote granted"
        );
        RequestVoteResponse {
            term: request.term,
            vote_granted: true,
        }
    }

    /// Count a pre-vote reply. A majority starts the real campaign; a
    /// refusal from a later term makes us a follower in that term.
    pub fn handle_pre_vote_response(
        &mut self,
        from: NodeId,
        sent_term: Term,
        response: &RequestVoteResponse,
        now: Instant,
        membership: &Membership,
    ) -> Ready {
        let mut ready = Ready::default();
        if self.disabled || self.pre_votes.is_none() || sent_term != self.current_term + 1 {
            return ready;
        }
        if !response.vote_granted {
            if response.term > self.current_term {
                self.become_follower(response.term, None);
                self.reset_election_timer(now);
            }
            return ready;
        }
        if !membership.contains(from) {
            return ready;
        }
        let granted = match self.pre_votes.as_mut() {
            Some(granted) => {
                granted.insert(from);
                granted.iter().filter(|&&v| membership.contains(v)).count()
            }
            None => return ready,
        };
        if granted >= membership.quorum() {
            self.start_election(now, membership, &mut ready);
        }
        ready
    }

    pub fn handle_vote_response(
        &mut self,
        from: NodeId,
        sent_term: Term,
        response: &RequestVoteResponse,
        now: Instant,
        membership: &Membership,
    ) -> Ready {
        let mut ready = Ready::default();
        if self.disabled {
            return ready;
        }
        if response.term > self.current_term {
            self.become_follower(response.term, None);
            self.reset_election_timer(now);
            return ready;
        }
        if self.role != Role::Candidate
            || self.current_term != sent_term
            || !response.vote_granted
            || !membership.contains(from)
        {
            return ready;
        }
        self.votes.insert(from);
        let granted = self.votes.iter().filter(|&&v| membership.contains(v)).count();
        if granted >= membership.quorum() {
            self.become_leader(now, membership, &mut ready);
        }
        ready
    }

    // ── AppendEntries (follower side) ───────────────────────────────

    /// Decide how to handle an append while holding the consensus lock.
    /// Term adoption and timer resets happen here; log changes are only
    /// planned.
    pub fn prepare_append(&mut self, request: &AppendEntries, now: Instant) -> AppendDecision {
        let reject = |term, hint| {
            AppendDecision::Reply(AppendEntriesResponse {
                term,
                success: false,
                match_index: hint,
            })
        };
        if self.disabled {
            return reject(self.current_term, 0);
        }
        if request.term < self.current_term {
            self.log_discard(ClusterError::Protocol {
                message: format!(
                    "append from {} in term {} behind term {}",
                    request.leader_id, request.term, self.current_term
                ),
            });
            return reject(self.current_term, 0);
        }
        if request.term == self.current_term && self.role == Role::Leader {
            error!(
                node_id = self.id,
                other = request.leader_id,
                term = self.current_term,
                "second leader observed in the same term; discarding append"
            );
            return reject(self.current_term, 0);
        }

        self.become_follower(request.term, Some(request.leader_id));
        self.reset_election_timer(now);
        self.last_leader_contact = Some(now);
        self.hold_off_until = None;

        match self.term_at(request.prev_log_index) {
            None => {
                return reject(self.current_term, self.last_index());
            }
            Some(term) if term != request.prev_log_term => {
                let hint = self.conflict_hint(request.prev_log_index, term);
                let error = ClusterError::LogInconsistency {
                    index: request.prev_log_index,
                };
                debug!(
                    code = error.code(),
                    error = %error,
                    ours = term,
                    theirs = request.prev_log_term,
                    hint,
                    "rejecting append"
                );
                return reject(self.current_term, hint);
            }
            Some(_) => {}
        }

        let mut truncate_after = None;
        let mut first_new = request.entries.len();
        for (i, entry) in request.entries.iter().enumerate() {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    truncate_after = Some(entry.index - 1);
                    first_new = i;
                    break;
                }
                None => {
                    first_new = i;
                    break;
                }
            }
        }
        if let Some(after) = truncate_after {
            if after < self.commit_index {
                error!(
                    after,
                    commit_index = self.commit_index,
                    leader = request.leader_id,
                    "leader tried to overwrite committed entries; discarding append"
                );
                return reject(self.current_term, request.prev_log_index.saturating_sub(1));
            }
        }

        let last_new_index = request.prev_log_index + request.entries.len() as u64;
        let entries = request.entries[first_new..].to_vec();
        if entries.is_empty() {
            self.advance_follower_commit(request.leader_commit, last_new_index);
            return AppendDecision::Reply(AppendEntriesResponse {
                term: self.current_term,
                success: true,
                match_index: last_new_index,
            });
        }
        AppendDecision::Write(AppendPlan {
            term: self.current_term,
            truncate_after,
            entries,
            leader_commit: request.leader_commit,
            last_new_index,
        })
    }

    /// Finish a planned append once it is durable. The in-memory log always
    /// mirrors the disk; success is reported only if the term is unchanged.
    pub fn apply_append(&mut self, plan: AppendPlan) -> AppendEntriesResponse {
        if let Some(after) = plan.truncate_after {
            self.log.truncate(after as usize);
        }
        self.log.extend(plan.entries);
        self.durable_index = self.last_index();

        if self.current_term != plan.term || self.disabled {
            return AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: 0,
            };
        }
        self.advance_follower_commit(plan.leader_commit, plan.last_new_index);
        AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: plan.last_new_index,
        }
    }

    fn advance_follower_commit(&mut self, leader_commit: LogIndex, last_new_index: LogIndex) {
        let target = leader_commit.min(last_new_index);
        if target > self.commit_index {
            self.commit_index = target;
        }
    }

    /// Back-off hint for a mismatch at `prev_index`: the entry before the
    /// first one carrying our conflicting term, but never below the commit
    /// index.
    fn conflict_hint(&self, prev_index: LogIndex, conflicting_term: Term) -> LogIndex {
        let mut i = prev_index;
        while i > self.commit_index + 1 && self.term_at(i - 1) == Some(conflicting_term) {
            i -= 1;
        }
        i.saturating_sub(1)
    }

    // ── AppendEntries (leader side) ─────────────────────────────────

    /// One AppendEntries per peer, carrying whatever each one is missing.
    pub fn replicate(&mut self, membership: &Membership) -> Vec<Outbound> {
        if self.role != Role::Leader {
            return Vec::new();
        }
        let peers: Vec<NodeId> = membership.peers(self.id).map(|p| p.id).collect();
        peers
            .into_iter()
            .filter_map(|peer| self.append_for(peer))
            .collect()
    }

    fn append_for(&mut self, peer: NodeId) -> Option<Outbound> {
        let last = self.last_index();
        let leader = self.leader.as_mut()?;
        let next = leader.next_index.entry(peer).or_insert(last + 1);
        if *next > last + 1 {
            *next = last + 1;
        }
        let prev = *next - 1;
        let prev_term = self.term_at(prev).unwrap_or(0);
        let end = last.min(prev + self.timing.max_append_entries as u64);
        let entries = if end > prev {
            self.log[prev as usize..end as usize].to_vec()
        } else {
            Vec::new()
        };
        Some(Outbound::Append {
            to: peer,
            request: AppendEntries {
                term: self.current_term,
                leader_id: self.id,
                prev_log_index: prev,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.commit_index,
            },
        })
    }

    pub fn handle_append_response(
        &mut self,
        from: NodeId,
        sent_term: Term,
        response: &AppendEntriesResponse,
        now: Instant,
        membership: &Membership,
    ) -> Ready {
        let mut ready = Ready::default();
        if self.disabled {
            return ready;
        }
        if response.term > self.current_term {
            self.become_follower(response.term, None);
            self.reset_election_timer(now);
            return ready;
        }
        if self.role != Role::Leader || self.current_term != sent_term {
            return ready;
        }
        let last = self.last_index();
        let Some(leader) = self.leader.as_mut() else {
            return ready;
        };
        leader.last_contact.insert(from, now);

        if response.success {
            let matched = leader.match_index.entry(from).or_insert(0);
            if response.match_index > *matched {
                *matched = response.match_index;
            }
            let matched = *matched;
            let next = leader.next_index.entry(from).or_insert(last + 1);
            if matched + 1 > *next {
                *next = matched + 1;
            }
            self.advance_commit(membership);
            if matched < last && membership.contains(from) {
                ready.messages.extend(self.append_for(from));
            }
        } else {
            let next = leader.next_index.entry(from).or_insert(last + 1);
            let backed_off = next
                .saturating_sub(1)
                .min(response.match_index + 1)
                .max(1);
            if backed_off < *next {
                *next = backed_off;
                debug!(peer = from, next_index = backed_off, "backing off");
                if membership.contains(from) {
                    ready.messages.extend(self.append_for(from));
                }
            }
        }
        ready
    }

    /// Move the commit index to the highest current-term entry stored on a
    /// majority. The leader counts itself only for entries it has persisted.
    fn advance_commit(&mut self, membership: &Membership) {
        let Some(leader) = &self.leader else {
            return;
        };
        let quorum = membership.quorum();
        let mut new_commit = self.commit_index;
        for n in (self.commit_index + 1..=self.last_index()).rev() {
            if self.term_at(n) != Some(self.current_term) {
                // Earlier entries are older still; they commit only
                // indirectly through a current-term entry.
                break;
            }
            let stored = membership
                .ids()
                .filter(|&id| {
                    let matched = if id == self.id {
                        self.durable_index
                    } else {
                        leader.match_index.get(&id).copied().unwrap_or(0)
                    };
                    matched >= n
                })
                .count();
            if stored >= quorum {
                new_commit = n;
                break;
            }
        }
        if new_commit > self.commit_index {
            debug!(
                from = self.commit_index,
                to = new_commit,
                term = self.current_term,
                "commit index advanced"
            );
            self.commit_index = new_commit;
        }
    }

    // ── Proposals ───────────────────────────────────────────────────

    /// Append a new entry to the leader's log. The caller persists it and
    /// then reports back through [`RaftCore::entries_persisted`].
    pub fn propose(&mut self, payload: EntryPayload) -> Result<LogEntry, ClusterError> {
        if self.role != Role::Leader || self.disabled {
            return Err(ClusterError::NotLeader {
                leader_id: self.leader_id,
            });
        }
        let entry = LogEntry {
            index: self.last_index() + 1,
            term: self.current_term,
            payload,
        };
        self.log.push(entry.clone());
        Ok(entry)
    }

    /// Record that the local log is durable through `index`.
    pub fn entries_persisted(&mut self, index: LogIndex, membership: &Membership) {
        if index > self.durable_index && index <= self.last_index() {
            self.durable_index = index;
        }
        self.advance_commit(membership);
    }

    /// Committed entries not yet handed out, in log order.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let from = self.last_applied as usize;
        let to = self.commit_index as usize;
        self.last_applied = self.commit_index;
        self.log[from..to].to_vec()
    }
}
