//! Health worker.
//!
//! Runs beside the Raft driver on its own interval. It reads only the
//! published [`RaftView`], pings peers for reachability, and reports. It never
//! changes Raft state: leadership moves only through Raft's own election
//! timeout, so the worker's failover signal is advisory.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::cluster::lifecycle::Lifecycle;
use crate::config::HealthConfig;
use crate::errors::ClusterError;
use crate::metrics::{FAILOVER_SUSPECTED, HEALTHY_NODES, HEALTH_CHECKS_TOTAL};
use crate::raft::node::{RaftNode, RaftView};
use crate::raft::{NodeId, Role};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Ok,
    Warning,
    Error,
    Critical,
}

/// Result of the most recent health check.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthReport {
    pub overall_status: OverallStatus,
    /// Reachable voting members, this node included when it votes.
    pub healthy_nodes: usize,
    pub total_nodes: usize,
    pub has_quorum: bool,
    pub quorum_threshold: usize,
    pub leader_id: Option<NodeId>,
    pub failover_suspected: bool,
    pub health_checks_performed: u64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// RFC 3339 timestamp of the last completed check.
    pub last_check: Option<String>,
}

impl HealthReport {
    /// Placeholder until the first check completes.
    pub fn pending() -> Self {
        Self {
            overall_status: OverallStatus::Warning,
            healthy_nodes: 0,
            total_nodes: 0,
            has_quorum: false,
            quorum_threshold: 0,
            leader_id: None,
            failover_suspected: false,
            health_checks_performed: 0,
            warnings: vec!["no health check has completed yet".to_string()],
            errors: Vec::new(),
            last_check: None,
        }
    }

    pub(crate) fn failed(reason: String, checks: u64) -> Self {
        Self {
            overall_status: OverallStatus::Critical,
            health_checks_performed: checks,
            warnings: Vec::new(),
            errors: vec![reason],
            last_check: Some(chrono::Utc::now().to_rfc3339()),
            ..Self::pending()
        }
    }
}

pub type SharedReport = Arc<RwLock<HealthReport>>;

/// Evaluate one check. `silent_since` is the last time a leader was heard
/// from, or when the worker started if never.
pub fn assess(
    view: &RaftView,
    reachable_peers: usize,
    checks: u64,
    silent_since: Instant,
    failure_timeout: Duration,
    now: Instant,
) -> HealthReport {
    let voter = view.is_member();
    let total = view.members.len();
    let healthy = reachable_peers + usize::from(voter);
    let quorum = total / 2 + 1;
    let has_quorum = total > 0 && healthy >= quorum;
    let failover_suspected = voter
        && view.role != Role::Leader
        && now.saturating_duration_since(silent_since) > failure_timeout;

    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    if view.storage_failed {
        errors.push("log storage failed; node no longer participates".to_string());
    }
    if !has_quorum {
        errors.push(format!(
            "{healthy} of {total} members reachable, quorum needs {quorum}"
        ));
    } else if healthy < total {
        warnings.push(format!("{} member(s) unreachable", total - healthy));
    }
    if !voter {
        warnings.push("this node is not a voting member".to_string());
    }
    if view.leader_id.is_none() {
        warnings.push("no known leader".to_string());
    }
    if failover_suspected {
        warnings.push(format!(
            "no leader contact for more than {}ms",
            failure_timeout.as_millis()
        ));
    }

    let overall_status = if view.storage_failed {
        OverallStatus::Critical
    } else if !errors.is_empty() {
        OverallStatus::Error
    } else if !warnings.is_empty() {
        OverallStatus::Warning
    } else {
        OverallStatus::Ok
    };

    HealthReport {
        overall_status,
        healthy_nodes: healthy,
        total_nodes: total,
        has_quorum,
        quorum_threshold: quorum,
        leader_id: view.leader_id,
        failover_suspected,
        health_checks_performed: checks,
        warnings,
        errors,
        last_check: Some(chrono::Utc::now().to_rfc3339()),
    }
}

pub struct HealthWorker {
    node: Arc<RaftNode>,
    transport: Arc<dyn Transport>,
    lifecycle: Arc<Lifecycle>,
    config: HealthConfig,
    ping_timeout: Duration,
    report: SharedReport,
    started: Instant,
    checks: u64,
    suspected: bool,
}

impl HealthWorker {
    pub fn new(
        node: Arc<RaftNode>,
        transport: Arc<dyn Transport>,
        lifecycle: Arc<Lifecycle>,
        config: HealthConfig,
        ping_timeout: Duration,
        report: SharedReport,
    ) -> Self {
        Self {
            node,
            transport,
            lifecycle,
            config,
            ping_timeout,
            report,
            started: Instant::now(),
            checks: 0,
            suspected: false,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.initialize_transport().await {
            error!(code = e.code(), error = %e, "transport initialization exhausted its retries");
            self.lifecycle.fail();
            self.store_report(HealthReport::failed(e.to_string(), self.checks));
            return;
        }

        let mut ticker = interval(Duration::from_millis(self.config.worker_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.tick().await {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("health worker stopped");
    }

    async fn initialize_transport(&self) -> Result<(), ClusterError> {
        let attempts = self.config.transport_init_attempts.max(1);
        let backoff = Duration::from_millis(self.config.transport_init_backoff_ms);
        let mut attempt = 1;
        loop {
            match self.transport.initialize().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "transport initialization failed; retrying");
                    tokio::time::sleep(backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// One check. Returns false once the node can no longer participate.
    async fn tick(&mut self) -> bool {
        let view = self.node.view();
        self.checks += 1;
        counter!(HEALTH_CHECKS_TOTAL).increment(1);

        if view.storage_failed {
            if self.lifecycle.fail() {
                error!(node_id = view.node_id, "storage failure observed; health worker stopping");
            }
            self.store_report(HealthReport::failed(
                "log storage failed; node no longer participates".to_string(),
                self.checks,
            ));
            return false;
        }

        let reachable = self.ping_peers(&view).await;
        let now = Instant::now();
        let silent_since = view
            .last_leader_contact
            .map_or(self.started, |t| t.max(self.started));
        let report = assess(
            &view,
            reachable,
            self.checks,
            silent_since,
            Duration::from_millis(self.config.primary_failure_timeout_ms),
            now,
        );

        gauge!(HEALTHY_NODES).set(report.healthy_nodes as f64);
        gauge!(FAILOVER_SUSPECTED).set(if report.failover_suspected { 1.0 } else { 0.0 });
        if report.failover_suspected != self.suspected {
            if report.failover_suspected {
                warn!(
                    node_id = view.node_id,
                    term = view.current_term,
                    timeout_ms = self.config.primary_failure_timeout_ms,
                    "leader unreachable past the failure timeout; awaiting election"
                );
            } else {
                info!(node_id = view.node_id, leader = ?view.leader_id, "leader contact restored");
            }
            self.suspected = report.failover_suspected;
        }
        if !report.has_quorum {
            debug!(healthy = report.healthy_nodes, total = report.total_nodes, "quorum not reachable");
        }
        self.store_report(report);

        if self.lifecycle.mark_running() {
            info!(node_id = view.node_id, "health worker running");
        }
        true
    }

    /// Count voting peers that answer a ping within the timeout.
    async fn ping_peers(&self, view: &RaftView) -> usize {
        let mut pings = JoinSet::new();
        for peer in view.members.iter().filter(|m| m.id != view.node_id).cloned() {
            let transport = Arc::clone(&self.transport);
            let limit = self.ping_timeout;
            pings.spawn(async move { matches!(timeout(limit, transport.ping(&peer)).await, Ok(Ok(()))) });
        }
        let mut reachable = 0;
        while let Some(result) = pings.join_next().await {
            if matches!(result, Ok(true)) {
                reachable += 1;
            }
        }
        reachable
    }

    fn store_report(&self, report: HealthReport) {
        *self.report.write().expect("lock poisoned") = report;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::NodeInfo;

    fn view(role: Role, leader_id: Option<NodeId>) -> RaftView {
        RaftView {
            node_id: 1,
            role,
            leader_id,
            members: (1..=3)
                .map(|id| NodeInfo::new(id, "127.0.0.1", 7000 + id as u16))
                .collect(),
            ..RaftView::default()
        }
    }

    #[test]
    fn test_all_reachable_is_ok() {
        let now = Instant::now();
        let report = assess(
            &view(Role::Follower, Some(2)),
            2,
            7,
            now,
            Duration::from_secs(5),
            now,
        );
        assert_eq!(report.overall_status, OverallStatus::Ok);
        assert_eq!(report.healthy_nodes, 3);
        assert_eq!(report.quorum_threshold, 2);
        assert!(report.has_quorum);
        assert!(!report.failover_suspected);
        assert_eq!(report.health_checks_performed, 7);
        assert!(report.last_check.is_some());
    }

    #[test]
    fn test_one_peer_down_is_warning() {
        let now = Instant::now();
        let report = assess(&view(Role::Leader, Some(1)), 1, 1, now, Duration::from_secs(5), now);
        assert_eq!(report.overall_status, OverallStatus::Warning);
        assert!(report.has_quorum);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_lost_quorum_is_error() {
        let now = Instant::now();
        let report = assess(&view(Role::Follower, None), 0, 1, now, Duration::from_secs(5), now);
        assert_eq!(report.overall_status, OverallStatus::Error);
        assert!(!report.has_quorum);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn test_failover_suspected_after_timeout() {
        let then = Instant::now();
        let now = then + Duration::from_secs(6);
        let report = assess(&view(Role::Follower, Some(2)), 2, 1, then, Duration::from_secs(5), now);
        assert!(report.failover_suspected);
        assert_eq!(report.overall_status, OverallStatus::Warning);

        // A leader never suspects itself.
        let report = assess(&view(Role::Leader, Some(1)), 2, 1, then, Duration::from_secs(5), now);
        assert!(!report.failover_suspected);
    }

    #[test]
    fn test_storage_failure_is_critical() {
        let now = Instant::now();
        let mut failed = view(Role::Follower, Some(2));
        failed.storage_failed = true;
        let report = assess(&failed, 2, 1, now, Duration::from_secs(5), now);
        assert_eq!(report.overall_status, OverallStatus::Critical);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_value(HealthReport::pending()).unwrap();
        assert_eq!(json["overall_status"], "warning");
        assert_eq!(json["last_check"], serde_json::Value::Null);
    }
}
