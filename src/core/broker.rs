use crate::core::error;
use crate::core::pool;
use crate::core::schemas;
use crate::core::time;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// The DB Broker is the "Thin Waist" for state mutation.
///
/// Every write to the delegation store goes through `with_conn`, which
/// serializes it behind the pool's per-database write lock and appends one
/// audit line per operation to `broker.events.jsonl`.
pub struct DbBroker {
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub intent_ref: Option<String>,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(schemas::BROKER_EVENTS_NAME),
        }
    }

    /// Execute a closure with a serialized write connection to the specified DB.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, error::EngineError>
    where
        F: FnMut(&Connection) -> Result<R, error::EngineError>,
    {
        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let result = pool::global_pool().with_write(db_path, f);

        let status = if result.is_ok() { "success" } else { "error" };
        self.log_event(actor, intent_ref, op_name, &db_id, status)?;

        result
    }

    fn log_event(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op: &str,
        db_id: &str,
        status: &str,
    ) -> Result<(), error::EngineError> {
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            intent_ref: intent_ref.map(|s| s.to_string()),
            op: op.to_string(),
            db_id: db_id.to_string(),
            status: status.to_string(),
        };

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(error::EngineError::IoError)?;

        writeln!(f, "{}", serde_json::to_string(&ev)?).map_err(error::EngineError::IoError)?;
        Ok(())
    }
}

/// Read the broker audit log (oldest first). Unparseable lines are skipped.
pub fn read_audit_log(root: &Path) -> Result<Vec<BrokerEvent>, error::EngineError> {
    let path = root.join(schemas::BROKER_EVENTS_NAME);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str::<BrokerEvent>(line).ok())
        .collect())
}
