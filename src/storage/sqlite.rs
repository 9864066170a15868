//! SQLite-backed log store.
//!
//! Log entries, the hard state, the commit index and the node identity
//! live in one database file. Every write runs in its own transaction with
//! `synchronous = FULL`, so a returned `Ok` survives power loss.
//!
//! Because `rusqlite::Connection` is `!Sync`, it sits in a
//! `std::sync::Mutex` behind an `Arc` and every call runs on
//! `tokio::task::spawn_blocking`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::store::{check_append, check_sequence, LogStore, StorageError};
use crate::raft::log::{EntryPayload, HardState, LogEntry, NodeInfo};
use crate::raft::{LogIndex, Term};

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// Durable Raft log in a single SQLite file.
pub struct SqliteLogStore {
    /// `None` once [`LogStore::close`] has run.
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteLogStore {
    /// Open (or create) the database at `path` and initialize the schema.
    /// The integrity scan is left to [`LogStore::verify`], which recovery
    /// runs before trusting the log.
    ///
    /// Passing `":memory:"` creates a throwaway database.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        init_db(&conn)?;
        let (last_index, last_term) = last_index_and_term(&conn)?;
        info!(path, last_index, last_term, "log store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// A store without a connection, as after [`LogStore::close`]. Every
    /// call fails with [`StorageError::Closed`]. Stands in when the database
    /// cannot be opened, so the control surface can still report the failure.
    pub fn unavailable() -> Self {
        Self {
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `f` against the connection on the blocking pool.
    fn with_conn<T, F>(
        &self,
        f: F,
    ) -> Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + '_>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || -> Result<T, StorageError> {
                let mut guard = conn.lock().expect("mutex poisoned");
                let conn = guard.as_mut().ok_or(StorageError::Closed)?;
                f(conn)
            })
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
        })
    }
}

// ── Schema ──────────────────────────────────────────────────────────

/// Create tables if missing. Idempotent, runs on every startup.
fn init_db(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS raft_log (
            log_index INTEGER PRIMARY KEY,
            term      INTEGER NOT NULL,
            payload   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS raft_state (
            id           INTEGER PRIMARY KEY CHECK (id = 1),
            current_term INTEGER NOT NULL DEFAULT 0,
            voted_for    INTEGER,
            commit_index INTEGER NOT NULL DEFAULT 0
        );
        INSERT OR IGNORE INTO raft_state (id) VALUES (1);

        CREATE TABLE IF NOT EXISTS node_identity (
            id      INTEGER PRIMARY KEY CHECK (id = 1),
            node_id INTEGER NOT NULL,
            address TEXT NOT NULL,
            port    INTEGER NOT NULL
        );
        ",
    )?;

    let existing: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })
        .optional()?
        .flatten();

    if existing.map_or(true, |v| v < SCHEMA_VERSION) {
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, chrono::Utc::now().to_rfc3339()],
        )?;
    }
    Ok(())
}

// ── Row helpers ─────────────────────────────────────────────────────

fn last_index_and_term(conn: &Connection) -> Result<(LogIndex, Term), StorageError> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT log_index, term FROM raft_log ORDER BY log_index DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row.map_or((0, 0), |(i, t)| (i as LogIndex, t as Term)))
}

fn stored_commit_index(conn: &Connection) -> Result<LogIndex, StorageError> {
    let ci: i64 = conn.query_row(
        "SELECT commit_index FROM raft_state WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(ci as LogIndex)
}

fn decode_entry(index: i64, term: i64, payload: &str) -> Result<LogEntry, StorageError> {
    let payload: EntryPayload = serde_json::from_str(payload)?;
    Ok(LogEntry {
        index: index as LogIndex,
        term: term as Term,
        payload,
    })
}

fn verify_conn(conn: &Connection) -> Result<(), StorageError> {
    let mut stmt = conn.prepare("SELECT log_index, term FROM raft_log ORDER BY log_index")?;
    let pairs = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let last = pairs.last().map_or(0, |(i, _)| *i as LogIndex);
    check_sequence(pairs.into_iter().map(|(i, t)| (i as LogIndex, t as Term)))?;

    let commit_index = stored_commit_index(conn)?;
    if commit_index > last {
        return Err(StorageError::Corruption(format!(
            "commit index {} is beyond the last entry {}",
            commit_index, last
        )));
    }
    Ok(())
}

// ── LogStore implementation ─────────────────────────────────────────

impl LogStore for SqliteLogStore {
    fn append(
        &self,
        entries: Vec<LogEntry>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        self.with_conn(move |conn| {
            if entries.is_empty() {
                return Ok(());
            }
            let tx = conn.transaction()?;
            let (last_index, last_term) = last_index_and_term(&tx)?;
            check_append(last_index, last_term, &entries)?;
            {
                let mut stmt =
                    tx.prepare("INSERT INTO raft_log (log_index, term, payload) VALUES (?1, ?2, ?3)")?;
                for entry in &entries {
                    let payload = serde_json::to_string(&entry.payload)?;
                    stmt.execute(params![entry.index as i64, entry.term as i64, payload])?;
                }
            }
            tx.commit()?;
            debug!(
                first = entries[0].index,
                count = entries.len(),
                "appended log entries"
            );
            Ok(())
        })
    }

    fn entry_at(
        &self,
        index: LogIndex,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LogEntry>, StorageError>> + Send + '_>> {
        self.with_conn(move |conn| {
            let row: Option<(i64, i64, String)> = conn
                .query_row(
                    "SELECT log_index, term, payload FROM raft_log WHERE log_index = ?1",
                    params![index as i64],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            row.map(|(i, t, p)| decode_entry(i, t, &p)).transpose()
        })
    }

    fn entries_from(
        &self,
        start: LogIndex,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LogEntry>, StorageError>> + Send + '_>> {
        self.with_conn(move |conn| {
            let limit = i64::try_from(max).unwrap_or(i64::MAX);
            let mut stmt = conn.prepare(
                "SELECT log_index, term, payload FROM raft_log \
                 WHERE log_index >= ?1 ORDER BY log_index LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![start as i64, limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|(i, t, p)| decode_entry(*i, *t, p))
                .collect()
        })
    }

    fn truncate_after(
        &self,
        index: LogIndex,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let commit_index = stored_commit_index(&tx)?;
            if index < commit_index {
                return Err(StorageError::TruncateCommitted {
                    index,
                    commit_index,
                });
            }
            let removed = tx.execute(
                "DELETE FROM raft_log WHERE log_index > ?1",
                params![index as i64],
            )?;
            tx.commit()?;
            debug!(after = index, removed, "truncated log");
            Ok(())
        })
    }

    fn last_index_and_term(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(LogIndex, Term), StorageError>> + Send + '_>> {
        self.with_conn(|conn| last_index_and_term(conn))
    }

    fn load_hard_state(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<HardState, StorageError>> + Send + '_>> {
        self.with_conn(|conn| {
            let (term, voted_for): (i64, Option<i64>) = conn.query_row(
                "SELECT current_term, voted_for FROM raft_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(HardState {
                current_term: term as Term,
                voted_for: voted_for.map(|v| v as u64),
            })
        })
    }

    fn save_hard_state(
        &self,
        state: HardState,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE raft_state SET current_term = ?1, voted_for = ?2 WHERE id = 1",
                params![
                    state.current_term as i64,
                    state.voted_for.map(|v| v as i64)
                ],
            )?;
            Ok(())
        })
    }

    fn commit_index(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<LogIndex, StorageError>> + Send + '_>> {
        self.with_conn(|conn| stored_commit_index(conn))
    }

    fn set_commit_index(
        &self,
        index: LogIndex,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE raft_state SET commit_index = MAX(commit_index, ?1) WHERE id = 1",
                params![index as i64],
            )?;
            Ok(())
        })
    }

    fn load_identity(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<NodeInfo>, StorageError>> + Send + '_>> {
        self.with_conn(|conn| {
            let row: Option<(i64, String, i64)> = conn
                .query_row(
                    "SELECT node_id, address, port FROM node_identity WHERE id = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            Ok(row.map(|(id, address, port)| NodeInfo {
                id: id as u64,
                address,
                port: port as u16,
            }))
        })
    }

    fn save_identity(
        &self,
        identity: NodeInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO node_identity (id, node_id, address, port) \
                 VALUES (1, ?1, ?2, ?3)",
                params![identity.id as i64, identity.address, identity.port as i64],
            )?;
            Ok(())
        })
    }

    fn verify(&self) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        self.with_conn(|conn| verify_conn(conn))
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
                let taken = conn.lock().expect("mutex poisoned").take();
                match taken {
                    Some(conn) => {
                        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                        conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
                        info!("log store closed");
                        Ok(())
                    }
                    None => Ok(()),
                }
            })
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
