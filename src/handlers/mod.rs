//! HTTP handlers.
//!
//! `control` serves operators and `raftguard-ctl`; `raft` receives peer
//! RPCs from [`crate::transport::http::HttpTransport`].

pub mod control;
pub mod raft;
