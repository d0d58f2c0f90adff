//! Delegation chain resolution and override engine.
//!
//! Leaf first: [`store`] (read contract) and [`sqlite`] (its relational
//! implementation), [`walker`], [`override_gate`], [`concentration`],
//! [`cache`], then [`service`] (reads) and [`ledger`] (writes). [`Engine`]
//! wires one of each around a store directory.

pub mod cache;
pub mod chain;
pub mod concentration;
pub mod events;
pub mod latency;
pub mod ledger;
pub mod model;
pub mod override_gate;
pub mod service;
pub mod sqlite;
pub mod store;
pub mod walker;

use crate::core::config::EngineConfig;
use crate::core::error::EngineError;
use crate::core::store::Store;
use cache::ResolutionCache;
use concentration::ConcentrationMonitor;
use events::{JsonlSink, SignalSink};
use ledger::DelegationLedger;
use service::ResolutionService;
use sqlite::SqliteDelegationStore;
use std::path::Path;
use std::sync::Arc;

/// A resolution service and write path sharing one cache and monitor.
pub struct Engine {
    pub service: ResolutionService,
    pub ledger: DelegationLedger,
}

impl Engine {
    /// Load `delegation.toml` from the store root and log governance events
    /// to `governance.events.jsonl` beside it.
    pub fn open(store: &Store) -> Result<Self, EngineError> {
        let config = EngineConfig::load(&store.root)?;
        let sink: Arc<dyn SignalSink> = Arc::new(JsonlSink::new(&store.root));
        Self::with_parts(&store.root, config, sink)
    }

    pub fn with_parts(root: &Path, config: EngineConfig, sink: Arc<dyn SignalSink>) -> Result<Self, EngineError> {
        config.validate()?;
        let store = Arc::new(SqliteDelegationStore::open(root)?);
        let monitor = Arc::new(ConcentrationMonitor::new(config.concentration_threshold));
        let cache = Arc::new(ResolutionCache::new(monitor));
        let ledger = DelegationLedger::new(
            root,
            store.db_path(),
            Arc::clone(&cache),
            Arc::clone(&sink),
            config.clone(),
        );
        let service = ResolutionService::new(store, cache, sink, config);
        Ok(Self { service, ledger })
    }
}
