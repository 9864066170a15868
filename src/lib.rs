//! raftguard library -- Raft consensus and automatic failover.
//!
//! This crate provides a replicated consensus log with leader election,
//! single-step membership changes, a durable log store, a peer transport,
//! a health worker that reports failover conditions, and the HTTP control
//! surface that exposes all of it.

use std::sync::Arc;

pub mod cluster;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod raft;
pub mod server;
pub mod storage;
pub mod transport;

use crate::cluster::control::ClusterController;
use crate::config::Config;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Owner of the Raft node, the health worker and the control operations.
    pub controller: Arc<ClusterController>,
}
