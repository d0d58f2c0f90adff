//! Governance events: output signals consumed by external governance tooling.
//!
//! Emission never blocks or fails a resolution; a sink that cannot write logs
//! the failure and drops the event.

use crate::core::schemas;
use crate::core::time;
use crate::engine::latency::ResolutionPath;
use crate::engine::model::TargetRef;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A target whose share of a poll's resolved chains crossed the soft cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationSignal {
    pub poll_id: Option<String>,
    pub target: TargetRef,
    pub count: u64,
    pub total: u64,
    pub share: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GovernanceEvent {
    ConcentrationSoftCap(ConcentrationSignal),
    /// A cycle in stored data, met at read time.
    CycleViolation {
        delegator_id: String,
        poll_id: Option<String>,
        node: TargetRef,
    },
    SloBreach {
        path: ResolutionPath,
        delegator_id: String,
        poll_id: Option<String>,
        elapsed_ms: f64,
        budget_ms: u64,
    },
    ResolutionTimeout {
        delegator_id: String,
        poll_id: Option<String>,
        elapsed_ms: f64,
        deadline_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub ts: String,
    pub event_id: String,
    #[serde(flatten)]
    pub event: GovernanceEvent,
}

pub trait SignalSink: Send + Sync {
    fn emit(&self, event: GovernanceEvent);
}

/// Appends one JSON envelope per line to `governance.events.jsonl`.
pub struct JsonlSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(schemas::GOVERNANCE_EVENTS_NAME),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, envelope: &EventEnvelope) -> std::io::Result<()> {
        let line = serde_json::to_string(envelope)?;
        let _guard = self.write_lock.lock();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{}", line)
    }
}

impl SignalSink for JsonlSink {
    fn emit(&self, event: GovernanceEvent) {
        let envelope = EventEnvelope {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            event,
        };
        if let Err(e) = self.append(&envelope) {
            tracing::warn!(error = %e, path = %self.path.display(), "dropping governance event");
        }
    }
}

/// Keeps events in memory, for embedding callers and tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<GovernanceEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GovernanceEvent> {
        self.events.lock().clone()
    }

    pub fn drain(&self) -> Vec<GovernanceEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl SignalSink for MemorySink {
    fn emit(&self, event: GovernanceEvent) {
        self.events.lock().push(event);
    }
}

pub struct NullSink;

impl SignalSink for NullSink {
    fn emit(&self, _event: GovernanceEvent) {}
}

/// Read back `governance.events.jsonl` (oldest first). Unparseable lines are skipped.
pub fn read_event_log(root: &Path) -> Result<Vec<EventEnvelope>, crate::core::error::EngineError> {
    let path = root.join(schemas::GOVERNANCE_EVENTS_NAME);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str::<EventEnvelope>(line).ok())
        .collect())
}
