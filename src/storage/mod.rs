//! Durable log storage.
//!
//! [`store::LogStore`] is the contract Raft relies on for crash safety.
//! [`sqlite::SqliteLogStore`] is the production engine and
//! [`memory::MemoryLogStore`] backs tests and ephemeral runs.

pub mod memory;
pub mod sqlite;
pub mod store;
