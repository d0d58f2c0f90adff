use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn db_connect(db_path: &str) -> Result<Connection, error::EngineError> {
    db_connect_with_timeout(db_path, 5)
}

pub fn db_connect_with_timeout(
    db_path: &str,
    busy_timeout_secs: u32,
) -> Result<Connection, error::EngineError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(u64::from(busy_timeout_secs)))
        .map_err(error::EngineError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::EngineError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::EngineError::RusqliteError)?;
    Ok(conn)
}

pub fn delegation_db_path(root: &Path) -> PathBuf {
    root.join(schemas::DELEGATION_DB_NAME)
}

pub fn initialize_delegation_db(root: &Path) -> Result<(), error::EngineError> {
    fs::create_dir_all(root).map_err(|e| {
        error::EngineError::DatabaseInitializationError(format!("{}: {}", root.display(), e))
    })?;

    let broker = DbBroker::new(root);
    let db_path = delegation_db_path(root);
    broker.with_conn(&db_path, "engine", None, "delegation.init", |conn| {
        for stmt in schemas::DELEGATION_DB_STATEMENTS {
            conn.execute(stmt, [])?;
        }
        Ok(())
    })
}
