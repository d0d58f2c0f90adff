use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Failed to initialize database: {0}")]
    DatabaseInitializationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Delegation cycle detected: {delegator} -> {target} (poll: {})", .poll_id.as_deref().unwrap_or("global"))]
    CycleDetected {
        delegator: String,
        target: String,
        poll_id: Option<String>,
    },
    #[error("Delegator {delegator} already holds {limit} active delegations")]
    DelegationLimitExceeded { delegator: String, limit: usize },
    #[error("Legacy fixed-term delegation exceeds the term cap: {edge_start} -> {edge_end}")]
    LegacyTermExceeded { edge_start: String, edge_end: String },
    #[error("Invalid delegation target: {0}")]
    InvalidTarget(String),
    #[error("Invalid delegation window: {0}")]
    InvalidWindow(String),
}

impl EngineError {
    /// Structural rejections at the write boundary (the 4xx family).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::ValidationError(_)
                | EngineError::NotFound(_)
                | EngineError::CycleDetected { .. }
                | EngineError::DelegationLimitExceeded { .. }
                | EngineError::LegacyTermExceeded { .. }
                | EngineError::InvalidTarget(_)
                | EngineError::InvalidWindow(_)
        )
    }
}
