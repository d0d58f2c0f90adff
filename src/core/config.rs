//! Engine configuration: `delegation.toml` under the store root, with
//! environment overrides layered on top.
//!
//! ```toml
//! max_depth = 50
//! concentration_threshold = 0.05
//! deadline_ms = 2000
//! ```

use crate::core::error::EngineError;
use crate::core::schemas;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Simultaneous non-revoked edges a single delegator may hold.
    pub max_active_edges_per_delegator: usize,
    /// Hard cap on hops per resolution.
    pub max_depth: usize,
    /// Term cap for `legacy_fixed_term` edges, in years.
    pub legacy_term_years: u32,
    /// Share above which a soft-cap signal is raised.
    pub concentration_threshold: f64,
    /// Fast path (cache hit) latency budget.
    pub fast_path_budget_ms: u64,
    /// Slow path p95 latency budget.
    pub slow_path_budget_ms: u64,
    /// Hard per-resolution deadline (p99 ceiling).
    pub deadline_ms: u64,
    /// Samples retained per path for percentile reporting.
    pub latency_window: usize,
    /// Salt mixed into opaque tokens for anonymous chains.
    pub anonymization_salt: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_active_edges_per_delegator: 5,
            max_depth: 50,
            legacy_term_years: 4,
            concentration_threshold: 0.05,
            fast_path_budget_ms: 150,
            slow_path_budget_ms: 1500,
            deadline_ms: 2000,
            latency_window: 1024,
            anonymization_salt: "delegation-engine".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load `delegation.toml` from the store root (defaults when absent),
    /// apply environment overrides, then validate.
    pub fn load(root: &Path) -> Result<Self, EngineError> {
        let path = root.join(schemas::CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str::<EngineConfig>(&content)?
        } else {
            EngineConfig::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `DELEGATION_*` environment overrides. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<usize>("DELEGATION_MAX_DEPTH") {
            self.max_depth = v;
        }
        if let Some(v) = env_parse::<usize>("DELEGATION_MAX_ACTIVE_EDGES") {
            self.max_active_edges_per_delegator = v;
        }
        if let Some(v) = env_parse::<f64>("DELEGATION_CONCENTRATION_THRESHOLD") {
            self.concentration_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("DELEGATION_DEADLINE_MS") {
            self.deadline_ms = v;
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_depth == 0 {
            return Err(EngineError::ValidationError(
                "max_depth must be at least 1".to_string(),
            ));
        }
        if !(self.concentration_threshold > 0.0 && self.concentration_threshold <= 1.0) {
            return Err(EngineError::ValidationError(format!(
                "concentration_threshold must be in (0, 1], got {}",
                self.concentration_threshold
            )));
        }
        if self.fast_path_budget_ms > self.slow_path_budget_ms {
            return Err(EngineError::ValidationError(format!(
                "fast_path_budget_ms ({}) exceeds slow_path_budget_ms ({})",
                self.fast_path_budget_ms, self.slow_path_budget_ms
            )));
        }
        if self.latency_window == 0 {
            return Err(EngineError::ValidationError(
                "latency_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
