//! Worker lifecycle state.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// `INIT` until the first successful health tick, `RUNNING` afterwards,
/// `ERROR` once transport setup or storage fails. `ERROR` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerState {
    Init,
    Running,
    Error,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Init => "INIT",
            WorkerState::Running => "RUNNING",
            WorkerState::Error => "ERROR",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Init,
            1 => WorkerState::Running,
            _ => WorkerState::Error,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared lifecycle cell, written by the health worker and the Raft driver.
#[derive(Debug, Default)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// `INIT -> RUNNING`. No effect in any other state.
    pub fn mark_running(&self) -> bool {
        self.0
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Enter `ERROR`. Returns true on the first transition.
    pub fn fail(&self) -> bool {
        self.0.swap(2, Ordering::SeqCst) != 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.get(), WorkerState::Init);
        assert!(lifecycle.mark_running());
        assert!(!lifecycle.mark_running());
        assert_eq!(lifecycle.get(), WorkerState::Running);
        assert!(lifecycle.fail());
        assert!(!lifecycle.fail());
        assert!(!lifecycle.mark_running());
        assert_eq!(lifecycle.get().as_str(), "ERROR");
    }

    #[test]
    fn test_serializes_uppercase() {
        let json = serde_json::to_string(&WorkerState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }
}
