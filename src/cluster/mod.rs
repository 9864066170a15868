//! Cluster coordination on top of the Raft node: membership, the health
//! worker, and the control surface.

pub mod control;
pub mod health;
pub mod lifecycle;
pub mod membership;
pub mod status;

#[cfg(test)]
mod scenarios;
