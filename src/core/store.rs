//! Store handle for the delegation engine's on-disk state.
//!
//! A Store is the directory holding `delegation.db`, the broker audit log,
//! the governance event log and the optional `delegation.toml`.

use std::path::PathBuf;

/// Default store directory, relative to the working directory.
pub const DEFAULT_STORE_DIR: &str = ".delegation";

#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute (or caller-relative) path to the store root directory
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}
