//! The Delegation Store seam.
//!
//! The authoritative relational store is owned by the persistence layer; the
//! engine only needs the read contract below. `SqliteDelegationStore` is the
//! in-tree implementation.

use crate::core::error::EngineError;
use crate::engine::model::{DelegationEdge, TargetMetadata, TargetRef};
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Duration;

/// Which edges a read admits, by `poll_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EdgeScope {
    /// Global edges only (global resolution, no poll).
    GlobalOnly,
    /// Edges for this poll plus global edges.
    Poll(String),
    /// Edges of every poll plus global edges (write-time cycle checks).
    AnyPoll,
}

impl EdgeScope {
    /// The scope a resolution for `poll_id` reads.
    pub fn for_resolution(poll_id: Option<&str>) -> Self {
        match poll_id {
            Some(p) => EdgeScope::Poll(p.to_string()),
            None => EdgeScope::GlobalOnly,
        }
    }

    /// The scope a cycle check for a new edge on `poll_id` must cover: a
    /// poll-specific edge can combine with global edges, a global edge with
    /// any poll's edges.
    pub fn for_cycle_check(poll_id: Option<&str>) -> Self {
        match poll_id {
            Some(p) => EdgeScope::Poll(p.to_string()),
            None => EdgeScope::AnyPoll,
        }
    }

    /// Whether an edge with `edge_poll` falls in this scope. The in-memory
    /// form of the store's SQL scope clause.
    pub fn admits(&self, edge_poll: Option<&str>) -> bool {
        match (self, edge_poll) {
            (_, None) => true,
            (EdgeScope::GlobalOnly, Some(_)) => false,
            (EdgeScope::Poll(p), Some(e)) => p == e,
            (EdgeScope::AnyPoll, Some(_)) => true,
        }
    }
}

/// One batched read: everything a resolution (or a batch of them) needs.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub roots: Vec<String>,
    pub poll_id: Option<String>,
    pub scope: EdgeScope,
    pub now: DateTime<Utc>,
}

impl SnapshotRequest {
    pub fn for_resolution(roots: Vec<String>, poll_id: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            roots,
            poll_id: poll_id.map(str::to_string),
            scope: EdgeScope::for_resolution(poll_id),
            now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub query_count: u32,
    pub db_time: Duration,
}

/// Active edges reachable from a set of roots, plus the direct votes and
/// target metadata that resolution over them consults. Read in one store
/// snapshot so the override check and the edges agree.
#[derive(Debug, Clone)]
pub struct EdgeSnapshot {
    pub poll_id: Option<String>,
    pub now: DateTime<Utc>,
    edges_by_delegator: FxHashMap<String, Vec<DelegationEdge>>,
    voters: FxHashSet<String>,
    metadata: FxHashMap<TargetRef, TargetMetadata>,
    pub stats: SnapshotStats,
}

impl EdgeSnapshot {
    pub fn new(poll_id: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            poll_id: poll_id.map(str::to_string),
            now,
            edges_by_delegator: FxHashMap::default(),
            voters: FxHashSet::default(),
            metadata: FxHashMap::default(),
            stats: SnapshotStats::default(),
        }
    }

    pub fn insert_edge(&mut self, edge: DelegationEdge) {
        self.edges_by_delegator
            .entry(edge.delegator_id.clone())
            .or_default()
            .push(edge);
    }

    pub fn insert_voter(&mut self, user_id: impl Into<String>) {
        self.voters.insert(user_id.into());
    }

    pub fn insert_metadata(&mut self, metadata: TargetMetadata) {
        self.metadata.insert(metadata.target.clone(), metadata);
    }

    pub fn with_edges(mut self, edges: impl IntoIterator<Item = DelegationEdge>) -> Self {
        for edge in edges {
            self.insert_edge(edge);
        }
        self
    }

    pub fn edges_from(&self, delegator_id: &str) -> &[DelegationEdge] {
        self.edges_by_delegator
            .get(delegator_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn edges(&self) -> impl Iterator<Item = &DelegationEdge> {
        self.edges_by_delegator.values().flatten()
    }

    pub fn edge_count(&self) -> usize {
        self.edges_by_delegator.values().map(Vec::len).sum()
    }

    pub fn voters(&self) -> &FxHashSet<String> {
        &self.voters
    }

    pub fn metadata(&self, target: &TargetRef) -> Option<&TargetMetadata> {
        self.metadata.get(target)
    }
}

/// Read contract consumed from the Delegation Store.
pub trait DelegationStore: Send + Sync {
    /// Batched read of the reachable edge set, direct votes and metadata for
    /// `request.roots`, in one consistent store snapshot. Roots that voted
    /// directly on the poll are not expanded.
    fn read_snapshot(&self, request: &SnapshotRequest) -> Result<EdgeSnapshot, EngineError>;

    /// Per-node reads below serve the direct-vote check and operator
    /// queries (`edge list`, `target show`); resolution reads snapshots.
    ///
    /// Active edges held by `nodes` that apply to `poll_id` (poll-specific
    /// edges for it plus global edges; global only when `poll_id` is `None`),
    /// newest first per delegator.
    fn active_edges(
        &self,
        nodes: &[String],
        poll_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<DelegationEdge>, EngineError>;

    fn has_vote(&self, user_id: &str, poll_id: &str) -> Result<bool, EngineError>;

    fn target_metadata(&self, target: &TargetRef) -> Result<Option<TargetMetadata>, EngineError>;

    /// Active edges applying to `poll_id`; every active edge when `None`.
    fn active_edge_count(
        &self,
        poll_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, EngineError>;
}
