//! SQLite connection pool with read/write separation and retry logic.
//!
//! - Maintains a **write mutex** per DB for serialized write access
//! - Creates fresh **read connections** per operation (no mutex, concurrent via WAL)
//! - Retries writes that hit `SQLITE_BUSY` / `SQLITE_LOCKED` with exponential backoff
//!
//! Connections are NOT pooled (opened fresh each time); the resolution hot path
//! is served from the in-process cache, so the store only sees cache misses.

use crate::core::db;
use crate::core::error::EngineError;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

/// Maximum retry attempts for busy/locked errors.
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 20;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 1_000;

/// Write connection busy_timeout in seconds.
const WRITE_BUSY_TIMEOUT_SECS: u32 = 5;
/// Read connection busy_timeout in seconds.
const READ_BUSY_TIMEOUT_SECS: u32 = 2;

/// Per-database entry holding a write mutex for serialized write access.
struct PoolEntry {
    write_lock: Mutex<()>,
    db_path: PathBuf,
}

/// Connection pool providing read/write separation per SQLite database.
pub struct SqlitePool {
    entries: Mutex<HashMap<PathBuf, &'static PoolEntry>>,
}

impl SqlitePool {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get_entry(&self, db_path: &Path) -> Result<&'static PoolEntry, EngineError> {
        let key = db_path.to_path_buf();
        let mut entries = self.entries.lock().map_err(|_| {
            EngineError::ValidationError("SqlitePool entries lock poisoned".to_string())
        })?;
        if let Some(entry) = entries.get(&key) {
            return Ok(*entry);
        }
        // One entry per database file for the life of the process.
        let entry = Box::leak(Box::new(PoolEntry {
            write_lock: Mutex::new(()),
            db_path: key.clone(),
        }));
        entries.insert(key, entry);
        Ok(entry)
    }

    /// Execute a closure with a write connection for the given DB path.
    /// Write access is serialized per-DB via mutex; busy errors are retried.
    pub fn with_write<F, R>(&self, db_path: &Path, mut f: F) -> Result<R, EngineError>
    where
        F: FnMut(&Connection) -> Result<R, EngineError>,
    {
        let entry = self.get_entry(db_path)?;
        let _guard = entry
            .write_lock
            .lock()
            .map_err(|_| EngineError::ValidationError("Pool write lock poisoned".to_string()))?;

        retry_on_busy(|| {
            let conn = db::db_connect_with_timeout(
                &entry.db_path.to_string_lossy(),
                WRITE_BUSY_TIMEOUT_SECS,
            )?;
            f(&conn)
        })
    }

    /// Execute a closure with a query-only read connection (no mutex
    /// serialization). WAL mode allows concurrent readers across threads and
    /// processes, and a reader never blocks the writer.
    pub fn with_read<F, R>(&self, db_path: &Path, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&Connection) -> Result<R, EngineError>,
    {
        let conn = db::db_connect_with_timeout(&db_path.to_string_lossy(), READ_BUSY_TIMEOUT_SECS)?;
        conn.pragma_update(None, "query_only", true)?;
        f(&conn)
    }
}

/// Retry a closure on `SQLITE_BUSY` / `DatabaseLocked` with exponential backoff.
fn retry_on_busy<F, R>(mut f: F) -> Result<R, EngineError>
where
    F: FnMut() -> Result<R, EngineError>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy_error(&e) && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay_ms = (BASE_DELAY_MS * 2u64.pow(attempt - 1)).min(MAX_DELAY_MS);
                tracing::debug!(attempt, delay_ms, "sqlite busy, retrying write");
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if an error is a SQLite busy/locked error that is retryable.
fn is_busy_error(err: &EngineError) -> bool {
    match err {
        EngineError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Global pool instance (same lifetime as the process).
pub fn global_pool() -> &'static SqlitePool {
    static POOL: OnceLock<SqlitePool> = OnceLock::new();
    POOL.get_or_init(SqlitePool::new)
}
