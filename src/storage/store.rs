//! Log store trait and the errors every engine reports.
//!
//! A write that returns `Ok` is durable: Raft acknowledges appends and
//! grants votes only after the corresponding call has completed.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::raft::log::{HardState, LogEntry, NodeInfo};
use crate::raft::{LogIndex, Term};

/// Failures surfaced by a [`LogStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("log store is closed")]
    Closed,

    /// The node stopped trusting its store after an earlier failure.
    #[error("log store failed earlier; node is fenced until restart")]
    Fenced,

    #[error("refusing to truncate after index {index}: entries through {commit_index} are committed")]
    TruncateCommitted {
        index: LogIndex,
        commit_index: LogIndex,
    },

    #[error("non-contiguous append: expected index {expected}, got {got}")]
    NonContiguous { expected: LogIndex, got: LogIndex },

    #[error("entry {index} has a lower term than its predecessor")]
    TermRegression { index: LogIndex },

    #[error("log corruption detected: {0}")]
    Corruption(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Task(String),

    #[error("write failed: {0}")]
    Io(String),
}

/// Async log persistence contract.
pub trait LogStore: Send + Sync + 'static {
    /// Append `entries`, which must continue the log contiguously.
    fn append(
        &self,
        entries: Vec<LogEntry>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// Fetch the entry at `index`, if present.
    fn entry_at(
        &self,
        index: LogIndex,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LogEntry>, StorageError>> + Send + '_>>;

    /// Up to `max` entries starting at `start`, in index order.
    fn entries_from(
        &self,
        start: LogIndex,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LogEntry>, StorageError>> + Send + '_>>;

    /// Delete every entry after `index`. Fails with
    /// [`StorageError::TruncateCommitted`] when `index` is below the
    /// recorded commit index.
    fn truncate_after(
        &self,
        index: LogIndex,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// `(0, 0)` for an empty log.
    fn last_index_and_term(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(LogIndex, Term), StorageError>> + Send + '_>>;

    fn load_hard_state(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<HardState, StorageError>> + Send + '_>>;

    fn save_hard_state(
        &self,
        state: HardState,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    fn commit_index(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<LogIndex, StorageError>> + Send + '_>>;

    /// Record the commit index. Lower values than the stored one are ignored.
    fn set_commit_index(
        &self,
        index: LogIndex,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// Identity recorded by the first successful `init`.
    fn load_identity(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<NodeInfo>, StorageError>> + Send + '_>>;

    fn save_identity(
        &self,
        identity: NodeInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// Integrity scan: indices contiguous from 1, terms non-decreasing.
    fn verify(&self) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;

    /// Flush and release the store. Later writes fail with `Closed`.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;
}

// ── Shared checks ───────────────────────────────────────────────────

/// Validate that `entries` may follow a log ending at `(last_index, last_term)`.
pub fn check_append(
    last_index: LogIndex,
    last_term: Term,
    entries: &[LogEntry],
) -> Result<(), StorageError> {
    let mut expected = last_index + 1;
    let mut prev_term = last_term;
    for entry in entries {
        if entry.index != expected {
            return Err(StorageError::NonContiguous {
                expected,
                got: entry.index,
            });
        }
        if entry.term < prev_term {
            return Err(StorageError::TermRegression { index: entry.index });
        }
        expected += 1;
        prev_term = entry.term;
    }
    Ok(())
}

/// Scan `(index, term)` pairs in index order for gaps and term regressions.
pub fn check_sequence<I>(pairs: I) -> Result<(), StorageError>
where
    I: IntoIterator<Item = (LogIndex, Term)>,
{
    let mut expected = 1;
    let mut prev_term = 0;
    for (index, term) in pairs {
        if index != expected {
            return Err(StorageError::Corruption(format!(
                "expected entry {} but found {}",
                expected, index
            )));
        }
        if term < prev_term {
            return Err(StorageError::Corruption(format!(
                "term regresses from {} to {} at entry {}",
                prev_term, term, index
            )));
        }
        expected += 1;
        prev_term = term;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::EntryPayload;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry {
            index,
            term,
            payload: EntryPayload::Noop,
        }
    }

    #[test]
    fn test_check_append_accepts_continuation() {
        assert!(check_append(2, 1, &[entry(3, 1), entry(4, 2)]).is_ok());
        assert!(check_append(0, 0, &[]).is_ok());
    }

    #[test]
    fn test_check_append_rejects_gap_and_regression() {
        assert!(matches!(
            check_append(2, 1, &[entry(4, 1)]),
            Err(StorageError::NonContiguous { expected: 3, got: 4 })
        ));
        assert!(matches!(
            check_append(2, 3, &[entry(3, 2)]),
            Err(StorageError::TermRegression { index: 3 })
        ));
    }

    #[test]
    fn test_check_sequence() {
        assert!(check_sequence(vec![(1, 1), (2, 1), (3, 4)]).is_ok());
        assert!(matches!(
            check_sequence(vec![(1, 1), (3, 1)]),
            Err(StorageError::Corruption(_))
        ));
        assert!(matches!(
            check_sequence(vec![(1, 2), (2, 1)]),
            Err(StorageError::Corruption(_))
        ));
    }
}
