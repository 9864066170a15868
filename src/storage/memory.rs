//! In-memory log store.
//!
//! Nothing survives the process. Used by tests and by `storage.engine:
//! memory` for throwaway clusters. Writes can be made to fail on demand to
//! exercise the storage-failure path.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::store::{check_append, check_sequence, LogStore, StorageError};
use crate::raft::log::{HardState, LogEntry, NodeInfo};
use crate::raft::{LogIndex, Term};

#[derive(Default)]
struct Inner {
    entries: Vec<LogEntry>,
    hard_state: HardState,
    commit_index: LogIndex,
    identity: Option<NodeInfo>,
    closed: bool,
}

/// Log store held entirely in memory.
#[derive(Default)]
pub struct MemoryLogStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write fail with [`StorageError::Io`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Run `f` against the state, refusing writes when closed or failing.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut Inner) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io("injected write failure".into()));
        }
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if inner.closed {
            return Err(StorageError::Closed);
        }
        f(&mut inner)
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T, StorageError> {
        let inner = self.inner.lock().expect("mutex poisoned");
        if inner.closed {
            return Err(StorageError::Closed);
        }
        Ok(f(&inner))
    }
}

fn last_of(entries: &[LogEntry]) -> (LogIndex, Term) {
    entries.last().map_or((0, 0), |e| (e.index, e.term))
}

impl LogStore for MemoryLogStore {
    fn append(
        &self,
        entries: Vec<LogEntry>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let result = self.write(|inner| {
            let (last_index, last_term) = last_of(&inner.entries);
            check_append(last_index, last_term, &entries)?;
            inner.entries.extend(entries);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn entry_at(
        &self,
        index: LogIndex,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LogEntry>, StorageError>> + Send + '_>> {
        let result = self.read(|inner| {
            if index == 0 {
                return None;
            }
            inner.entries.get((index - 1) as usize).cloned()
        });
        Box::pin(async move { result })
    }

    fn entries_from(
        &self,
        start: LogIndex,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LogEntry>, StorageError>> + Send + '_>> {
        let result = self.read(|inner| {
            let skip = start.saturating_sub(1) as usize;
            inner.entries.iter().skip(skip).take(max).cloned().collect()
        });
        Box::pin(async move { result })
    }

    fn truncate_after(
        &self,
        index: LogIndex,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let result = self.write(|inner| {
            if index < inner.commit_index {
                return Err(StorageError::TruncateCommitted {
                    index,
                    commit_index: inner.commit_index,
                });
            }
            inner.entries.truncate(index as usize);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn last_index_and_term(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(LogIndex, Term), StorageError>> + Send + '_>> {
        let result = self.read(|inner| last_of(&inner.entries));
        Box::pin(async move { result })
    }

    fn load_hard_state(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<HardState, StorageError>> + Send + '_>> {
        let result = self.read(|inner| inner.hard_state);
        Box::pin(async move { result })
    }

    fn save_hard_state(
        &self,
        state: HardState,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let result = self.write(|inner| {
            inner.hard_state = state;
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn commit_index(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<LogIndex, StorageError>> + Send + '_>> {
        let result = self.read(|inner| inner.commit_index);
        Box::pin(async move { result })
    }

    fn set_commit_index(
        &self,
        index: LogIndex,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let result = self.write(|inner| {
            inner.commit_index = inner.commit_index.max(index);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn load_identity(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<NodeInfo>, StorageError>> + Send + '_>> {
        let result = self.read(|inner| inner.identity.clone());
        Box::pin(async move { result })
    }

    fn save_identity(
        &self,
        identity: NodeInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let result = self.write(|inner| {
            inner.identity = Some(identity);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn verify(&self) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let result = self
            .read(|inner| check_sequence(inner.entries.iter().map(|e| (e.index, e.term))))
            .and_then(|checked| checked);
        Box::pin(async move { result })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        self.inner.lock().expect("mutex poisoned").closed = true;
        Box::pin(async { Ok(()) })
    }
}
