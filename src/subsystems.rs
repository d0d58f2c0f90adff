//! Subsystem registration: centralizes all DB initialization functions.
//!
//! Adding a new store: append one entry to `SUBSYSTEMS`.

use crate::core::{db, error};
use std::path::Path;

pub(crate) struct SubsystemInit {
    pub name: &'static str,
    pub initialize_db: fn(&Path) -> Result<(), error::EngineError>,
}

/// Run sequentially at `init`; order matters for first-start reliability.
pub(crate) const SUBSYSTEMS: &[SubsystemInit] = &[SubsystemInit {
    name: "delegation",
    initialize_db: db::initialize_delegation_db,
}];

/// Initialize all subsystem databases sequentially. Returns the names
/// initialized.
pub(crate) fn initialize_all_dbs(data_root: &Path) -> Result<Vec<&'static str>, error::EngineError> {
    let mut done = Vec::with_capacity(SUBSYSTEMS.len());
    for sub in SUBSYSTEMS {
        (sub.initialize_db)(data_root)?;
        tracing::debug!(subsystem = sub.name, root = %data_root.display(), "initialized");
        done.push(sub.name);
    }
    Ok(done)
}
