//! Prometheus metrics for raftguard.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, keeps the process-local Raft counters the
//! status surface reports, and exposes the `/metrics` endpoint handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "raftguard_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "raftguard_http_request_duration_seconds";

/// Raft messages handled, inbound requests and responses alike (counter).
pub const RAFT_MESSAGES_PROCESSED_TOTAL: &str = "raftguard_raft_messages_processed_total";

/// Empty AppendEntries sent by the leader (counter).
pub const RAFT_HEARTBEATS_SENT_TOTAL: &str = "raftguard_raft_heartbeats_sent_total";

/// Campaigns started by this node (counter).
pub const RAFT_ELECTIONS_TRIGGERED_TOTAL: &str = "raftguard_raft_elections_triggered_total";

/// Current term (gauge).
pub const RAFT_TERM: &str = "raftguard_raft_term";

/// 1 while this node is leader (gauge).
pub const RAFT_IS_LEADER: &str = "raftguard_raft_is_leader";

/// Commit index (gauge).
pub const RAFT_COMMIT_INDEX: &str = "raftguard_raft_commit_index";

/// Health worker ticks (counter).
pub const HEALTH_CHECKS_TOTAL: &str = "raftguard_health_checks_total";

/// Reachable voting members including self (gauge).
pub const HEALTHY_NODES: &str = "raftguard_healthy_nodes";

/// 1 while the leader has been silent past the failure timeout (gauge).
pub const FAILOVER_SUSPECTED: &str = "raftguard_failover_suspected";

/// Storage failures that fenced this node (counter).
pub const STORAGE_FAILURES_TOTAL: &str = "raftguard_storage_failures_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(RAFT_MESSAGES_PROCESSED_TOTAL, "Raft messages handled");
    describe_counter!(RAFT_HEARTBEATS_SENT_TOTAL, "Heartbeats sent as leader");
    describe_counter!(RAFT_ELECTIONS_TRIGGERED_TOTAL, "Elections started");
    describe_gauge!(RAFT_TERM, "Current Raft term");
    describe_gauge!(RAFT_IS_LEADER, "1 when this node is the leader");
    describe_gauge!(RAFT_COMMIT_INDEX, "Highest committed log index");
    describe_counter!(HEALTH_CHECKS_TOTAL, "Health worker ticks");
    describe_gauge!(HEALTHY_NODES, "Reachable voting members including self");
    describe_gauge!(
        FAILOVER_SUSPECTED,
        "1 when no leader contact was seen within the failure timeout"
    );
    describe_counter!(STORAGE_FAILURES_TOTAL, "Storage failures that fenced the node");
}

// -- Raft counters ------------------------------------------------------------

/// Process-local message counters reported by the status surface. Every
/// increment is mirrored into the matching Prometheus counter.
#[derive(Debug, Default)]
pub struct Counters {
    messages_processed: AtomicU64,
    heartbeats_sent: AtomicU64,
    elections_triggered: AtomicU64,
}

impl Counters {
    pub fn message_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        counter!(RAFT_MESSAGES_PROCESSED_TOTAL).increment(1);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        counter!(RAFT_HEARTBEATS_SENT_TOTAL).increment(1);
    }

    pub fn election_triggered(&self) {
        self.elections_triggered.fetch_add(1, Ordering::Relaxed);
        counter!(RAFT_ELECTIONS_TRIGGERED_TOTAL).increment(1);
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    pub fn elections_triggered(&self) -> u64 {
        self.elections_triggered.load(Ordering::Relaxed)
    }
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Collapse path parameters so metric labels stay low-cardinality.
///
/// - `/control/nodes/4` -> `/control/nodes/{id}`
/// - `/control/log/17` -> `/control/log/{index}`
/// - anything else is reported as-is
fn normalize_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/control/nodes/") {
        if !rest.is_empty() {
            return "/control/nodes/{id}".to_string();
        }
    }
    if let Some(rest) = path.strip_prefix("/control/log/") {
        if rest != "stats" && !rest.is_empty() {
            return "/control/log/{index}".to_string();
        }
    }
    path.to_string()
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [("content-type", "text/plain; version=0.0.4")],
            "metrics are disabled\n".to_string(),
        ),
    }
}

// -- Tests --------------------------------------------------------------------
