//! Resolution Cache: `(delegator, poll)` to resolved chain, invalidated by
//! writes rather than by TTL.
//!
//! Each key owns a slot in a sharded map, so lookups and fills on different
//! keys never contend. A miss leaves a `Pending` slot stamped with a
//! generation drawn from one monotonic counter; `put` only lands while that
//! exact pending slot survives. Invalidation removes pending slots in scope,
//! so a resolution that read the store before a write can never publish its
//! answer after the write's invalidation point.
//!
//! The concentration monitor is updated while the slot's shard lock is held,
//! which keeps record/retract pairs ordered per key. Signals are returned to
//! the caller to be emitted outside the lock.

use crate::core::error::EngineError;
use crate::engine::chain::{ResolvedChain, Terminal};
use crate::engine::concentration::ConcentrationMonitor;
use crate::engine::events::ConcentrationSignal;
use crate::engine::model::{CacheKey, TargetRef};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A stored resolution: the serialized chain plus what it depends on.
#[derive(Debug, Clone)]
pub struct CachedResolution {
    payload: Vec<u8>,
    dependencies: FxHashSet<TargetRef>,
    pub terminal: Terminal,
    pub valid_until: Option<DateTime<Utc>>,
}

impl CachedResolution {
    pub fn from_chain(chain: &ResolvedChain, valid_until: Option<DateTime<Utc>>) -> Result<Self, EngineError> {
        let mut dependencies: FxHashSet<TargetRef> = chain.nodes().cloned().collect();
        if let Terminal::Unresolved { at: Some(at), .. } = &chain.terminal {
            dependencies.insert(at.clone());
        }
        Ok(Self {
            payload: serde_json::to_vec(chain)?,
            dependencies,
            terminal: chain.terminal.clone(),
            valid_until,
        })
    }

    pub fn decode(&self) -> Result<ResolvedChain, EngineError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn depends_on(&self, node: &TargetRef) -> bool {
        self.dependencies.contains(node)
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_none_or(|until| until > now)
    }
}

enum Slot {
    Pending {
        generation: u64,
    },
    Ready {
        generation: u64,
        entry: Arc<CachedResolution>,
    },
}

pub enum Lookup {
    Hit(Arc<CachedResolution>),
    /// Fill with `put(key, generation, ..)`. `signals` come from evicting an
    /// entry whose `valid_until` had passed.
    Miss {
        generation: u64,
        signals: Vec<ConcentrationSignal>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The slot was invalidated (or re-created) after the lookup.
    StaleGeneration,
    /// A concurrent request with the same generation filled it first.
    AlreadyFilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    Discarded(DiscardReason),
}

#[derive(Debug, Default)]
pub struct Invalidation {
    pub evicted: Vec<CacheKey>,
    pub signals: Vec<ConcentrationSignal>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub pending: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub discarded_puts: u64,
}

pub struct ResolutionCache {
    slots: DashMap<CacheKey, Slot>,
    monitor: Arc<ConcentrationMonitor>,
    next_generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    discarded_puts: AtomicU64,
}

impl ResolutionCache {
    pub fn new(monitor: Arc<ConcentrationMonitor>) -> Self {
        Self {
            slots: DashMap::new(),
            monitor,
            next_generation: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            discarded_puts: AtomicU64::new(0),
        }
    }

    pub fn monitor(&self) -> &Arc<ConcentrationMonitor> {
        &self.monitor
    }

    fn bump(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Read-only peek: a fresh ready entry, without claiming a fill.
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Arc<CachedResolution>> {
        match self.slots.get(key).as_deref() {
            Some(Slot::Ready { entry, .. }) if entry.is_fresh_at(now) => Some(Arc::clone(entry)),
            _ => None,
        }
    }

    /// Hit, or claim the fill for `key`. Concurrent misses on the same key
    /// share the pending generation; the first `put` wins.
    pub fn lookup(&self, key: &CacheKey, now: DateTime<Utc>) -> Lookup {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let (generation, signals) = match occupied.get() {
                    Slot::Ready { entry, .. } if entry.is_fresh_at(now) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Lookup::Hit(Arc::clone(entry));
                    }
                    Slot::Ready { entry, .. } => {
                        self.expirations.fetch_add(1, Ordering::Relaxed);
                        let signals = self
                            .monitor
                            .retract_resolution(key.poll_id.as_deref(), &entry.terminal);
                        (self.bump(), signals)
                    }
                    Slot::Pending { generation } => (*generation, Vec::new()),
                };
                occupied.insert(Slot::Pending { generation });
                self.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Miss {
                    generation,
                    signals,
                }
            }
            Entry::Vacant(vacant) => {
                let generation = self.bump();
                vacant.insert(Slot::Pending { generation });
                self.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Miss {
                    generation,
                    signals: Vec::new(),
                }
            }
        }
    }

    /// Store a resolution computed under `generation`. Records it with the
    /// concentration monitor when stored.
    pub fn put(
        &self,
        key: &CacheKey,
        generation: u64,
        entry: CachedResolution,
    ) -> (PutOutcome, Vec<ConcentrationSignal>) {
        let outcome = match self.slots.get_mut(key) {
            Some(mut slot) => {
                let (current, ready) = match &*slot {
                    Slot::Pending { generation } => (*generation, false),
                    Slot::Ready { generation, .. } => (*generation, true),
                };
                match (current == generation, ready) {
                    (true, false) => {
                        let signals = self
                            .monitor
                            .record_resolution(key.poll_id.as_deref(), &entry.terminal);
                        *slot = Slot::Ready {
                            generation,
                            entry: Arc::new(entry),
                        };
                        return (PutOutcome::Stored, signals);
                    }
                    (true, true) => DiscardReason::AlreadyFilled,
                    (false, _) => DiscardReason::StaleGeneration,
                }
            }
            None => DiscardReason::StaleGeneration,
        };
        self.discarded_puts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %key, generation, reason = ?outcome, "discarding cache fill");
        (PutOutcome::Discarded(outcome), Vec::new())
    }

    /// Release a claimed fill that will not be completed (timeout, store error).
    pub fn abandon(&self, key: &CacheKey, generation: u64) {
        self.slots.remove_if(key, |_, slot| {
            matches!(slot, Slot::Pending { generation: g } if *g == generation)
        });
    }

    /// Evict every slot the predicate selects. Ready slots are offered with
    /// their entry; pending slots with `None` and are judged by key alone.
    pub fn invalidate<F>(&self, predicate: F) -> Invalidation
    where
        F: Fn(&CacheKey, Option<&CachedResolution>) -> bool,
    {
        let mut invalidation = Invalidation::default();
        self.slots.retain(|key, slot| match slot {
            Slot::Pending { .. } => !predicate(key, None),
            Slot::Ready { entry, .. } => {
                if !predicate(key, Some(&**entry)) {
                    return true;
                }
                invalidation.signals.extend(
                    self.monitor
                        .retract_resolution(key.poll_id.as_deref(), &entry.terminal),
                );
                invalidation.evicted.push(key.clone());
                false
            }
        });
        self.evictions
            .fetch_add(invalidation.evicted.len() as u64, Ordering::Relaxed);
        invalidation.evicted.sort();
        invalidation
    }

    /// Drop every ready entry whose `valid_until` has passed, retracting it
    /// from the concentration monitor. Counted as expirations.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> Invalidation {
        let mut invalidation = Invalidation::default();
        self.slots.retain(|key, slot| match slot {
            Slot::Ready { entry, .. } if !entry.is_fresh_at(now) => {
                invalidation.signals.extend(
                    self.monitor
                        .retract_resolution(key.poll_id.as_deref(), &entry.terminal),
                );
                invalidation.evicted.push(key.clone());
                false
            }
            _ => true,
        });
        self.expirations
            .fetch_add(invalidation.evicted.len() as u64, Ordering::Relaxed);
        invalidation.evicted.sort();
        invalidation
    }

    pub fn invalidate_all(&self) -> Invalidation {
        self.invalidate(|_, _| true)
    }

    /// Ready entries.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (mut entries, mut pending) = (0, 0);
        for slot in self.slots.iter() {
            match slot.value() {
                Slot::Ready { .. } => entries += 1,
                Slot::Pending { .. } => pending += 1,
            }
        }
        CacheStats {
            entries,
            pending,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            discarded_puts: self.discarded_puts.load(Ordering::Relaxed),
        }
    }
}

/// Keys a write to `node`'s outgoing edges can affect. `edge_poll` is the
/// written edge's poll; a global edge reaches every poll.
pub fn edge_write_scope(
    node: &TargetRef,
    edge_poll: Option<&str>,
) -> impl Fn(&CacheKey, Option<&CachedResolution>) -> bool {
    let node = node.clone();
    let edge_poll = edge_poll.map(str::to_string);
    move |key: &CacheKey, entry: Option<&CachedResolution>| {
        let in_scope = edge_poll.is_none() || key.poll_id == edge_poll;
        in_scope && entry.is_none_or(|e| e.depends_on(&node))
    }
}

/// Keys a direct vote by `user_id` on `poll_id` can affect.
pub fn vote_scope(user_id: &str, poll_id: &str) -> impl Fn(&CacheKey, Option<&CachedResolution>) -> bool {
    let node = TargetRef::user(user_id);
    let poll = Some(poll_id.to_string());
    move |key: &CacheKey, entry: Option<&CachedResolution>| {
        key.poll_id == poll && entry.is_none_or(|e| e.depends_on(&node))
    }
}

/// Keys a change to `target`'s metadata can affect, across all polls.
pub fn target_scope(target: &TargetRef) -> impl Fn(&CacheKey, Option<&CachedResolution>) -> bool {
    let node = target.clone();
    move |_: &CacheKey, entry: Option<&CachedResolution>| entry.is_none_or(|e| e.depends_on(&node))
}

/// Keys of one poll (`Some`), or every key (`None`).
pub fn poll_scope(poll_id: Option<&str>) -> impl Fn(&CacheKey, Option<&CachedResolution>) -> bool {
    let poll = poll_id.map(str::to_string);
    move |key: &CacheKey, _: Option<&CachedResolution>| poll.is_none() || key.poll_id == poll
}
