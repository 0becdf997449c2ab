//! SQLite claim store
//!
//! Several runner processes on one machine (or on a shared volume) point at
//! the same database file. Every compare-and-set is a single statement, which
//! SQLite executes atomically under its write lock:
//!
//! - insert: `INSERT OR IGNORE` (succeeds only if the key is absent)
//! - update: `UPDATE ... WHERE key = ? AND version = ?`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{ClaimOutcome, ClaimRecord, ClaimState, ClaimStore, VersionedClaim};
use crate::{Result, StorageError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cobuild_claims (
    key        TEXT PRIMARY KEY,
    version    INTEGER NOT NULL,
    runner_id  TEXT NOT NULL,
    state      TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    outcome    TEXT,
    cache_key  TEXT
);
";

#[derive(Clone)]
pub struct SqliteClaimStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteClaimStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

type ClaimRow = (
    u64,
    String,
    String,
    DateTime<Utc>,
    Option<String>,
    Option<String>,
);

fn row_to_claim(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClaimRow> {
    Ok((
        row.get::<_, i64>(0)? as u64,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl SqliteClaimStore {
    /// Runs `f` on the blocking pool; a busy database can stall for the full busy timeout
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
            .await
            .map_err(|e| StorageError::database("SQLite task did not complete").with_source(e))?
    }
}

fn select_claim(conn: &Connection, key: &str) -> Result<Option<VersionedClaim>> {
    let row = conn
        .query_row(
            "SELECT version, runner_id, state, expires_at, outcome, cache_key
             FROM cobuild_claims WHERE key = ?1",
            params![key],
            row_to_claim,
        )
        .optional()?;

    let Some((version, runner_id, state, expires_at, outcome, cache_key)) = row else {
        return Ok(None);
    };

    let state = ClaimState::parse(&state).ok_or_else(|| {
        StorageError::serialization(format!("Invalid claim state '{}' for {}", state, key))
    })?;
    let outcome = match outcome {
        Some(s) => Some(ClaimOutcome::parse(&s).ok_or_else(|| {
            StorageError::serialization(format!("Invalid claim outcome '{}' for {}", s, key))
        })?),
        None => None,
    };

    Ok(Some(VersionedClaim {
        version,
        record: ClaimRecord {
            runner_id,
            state,
            expires_at,
            outcome,
            cache_key,
        },
    }))
}

fn write_claim(
    conn: &Connection,
    key: &str,
    expected_version: Option<u64>,
    record: &ClaimRecord,
) -> Result<Option<u64>> {
    let outcome = record.outcome.map(|o| o.as_str());

    let (changed, version) = match expected_version {
        None => {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO cobuild_claims
                 (key, version, runner_id, state, expires_at, outcome, cache_key)
                 VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key,
                    record.runner_id,
                    record.state.as_str(),
                    record.expires_at,
                    outcome,
                    record.cache_key,
                ],
            )?;
            (changed, 1)
        }
        Some(expected) => {
            let next = expected + 1;
            let changed = conn.execute(
                "UPDATE cobuild_claims
                 SET version = ?1, runner_id = ?2, state = ?3, expires_at = ?4,
                     outcome = ?5, cache_key = ?6
                 WHERE key = ?7 AND version = ?8",
                params![
                    next as i64,
                    record.runner_id,
                    record.state.as_str(),
                    record.expires_at,
                    outcome,
                    record.cache_key,
                    key,
                    expected as i64,
                ],
            )?;
            (changed, next)
        }
    };

    Ok((changed == 1).then_some(version))
}

#[async_trait]
impl ClaimStore for SqliteClaimStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedClaim>> {
        let key = key.to_string();
        self.with_conn(move |conn| select_claim(conn, &key)).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        record: &ClaimRecord,
    ) -> Result<Option<u64>> {
        let key = key.to_string();
        let record = record.clone();
        self.with_conn(move |conn| write_claim(conn, &key, expected_version, &record))
            .await
    }
}
