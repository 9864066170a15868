//! Peer messaging.
//!
//! The Raft driver only sees the [`Transport`] trait. [`http::HttpTransport`]
//! talks to peers over their HTTP surface; [`memory::MemoryNetwork`] wires
//! nodes in one process together for tests, with partition injection.

pub mod http;
pub mod memory;

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;

use thiserror::Error;

use crate::errors::ClusterError;
use crate::raft::log::NodeInfo;
use crate::raft::message::{
    AppendEntries, AppendEntriesResponse, RequestVote, RequestVoteResponse,
};

/// Transient delivery failures. None of these change local Raft state; the
/// driver treats them as lost messages.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not initialized")]
    NotInitialized,

    #[error("transport initialization failed: {0}")]
    Init(String),

    #[error("peer {node_id} is unreachable: {reason}")]
    Unreachable { node_id: u64, reason: String },

    #[error("peer {node_id} answered with HTTP {status}")]
    Rejected { node_id: u64, status: u16 },

    #[error("peer {node_id} failed to handle the message: {reason}")]
    Remote { node_id: u64, reason: String },
}

/// Receives inbound peer RPCs. Implemented by the Raft driver.
pub trait RpcHandler: Send + Sync {
    fn handle_request_vote(
        &self,
        request: RequestVote,
    ) -> Pin<Box<dyn Future<Output = Result<RequestVoteResponse, ClusterError>> + Send + '_>>;

    fn handle_append_entries(
        &self,
        request: AppendEntries,
    ) -> Pin<Box<dyn Future<Output = Result<AppendEntriesResponse, ClusterError>> + Send + '_>>;
}

/// Outbound peer messaging contract.
pub trait Transport: Send + Sync + 'static {
    /// Prepare the transport for use. Safe to call more than once.
    fn initialize(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    fn request_vote(
        &self,
        target: &NodeInfo,
        request: RequestVote,
    ) -> Pin<Box<dyn Future<Output = Result<RequestVoteResponse, TransportError>> + Send + '_>>;

    fn append_entries(
        &self,
        target: &NodeInfo,
        request: AppendEntries,
    ) -> Pin<Box<dyn Future<Output = Result<AppendEntriesResponse, TransportError>> + Send + '_>>;

    /// Cheap reachability check used by the health worker.
    fn ping(
        &self,
        target: &NodeInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Register the local handler for inbound messages. Transports that
    /// receive through the HTTP router ignore this.
    fn attach(&self, _handler: Weak<dyn RpcHandler>) {}
}
