//! Resolution Service: the read-only public contract.
//!
//! Per request: cache lookup; on a hit, decode and return (fast path). On a
//! miss the pending claim is taken first, then one store snapshot is read,
//! the override gate and walker run over it, and the answer is offered back
//! to the cache under the claimed generation (slow path). Every component
//! boundary is timed into a [`LatencyBreakdown`].

use crate::core::config::EngineConfig;
use crate::core::error::EngineError;
use crate::engine::cache::{CacheStats, CachedResolution, Lookup, PutOutcome, ResolutionCache, poll_scope};
use crate::engine::chain::{ResolvedChain, Terminal, TerminalKind, UnresolvedReason};
use crate::engine::concentration::ConcentrationSnapshot;
use crate::engine::events::{ConcentrationSignal, GovernanceEvent, SignalSink};
use crate::engine::latency::{Deadline, LatencyBreakdown, ResolutionPath, SloMonitor, SloReport, micros};
use crate::engine::model::{CacheKey, DelegationEdge, TargetMetadata, TargetRef};
use crate::engine::override_gate::{self, OverrideGate};
use crate::engine::store::{DelegationStore, EdgeSnapshot, SnapshotRequest};
use crate::engine::walker::{GraphWalker, WalkMemo, WalkOutcome};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub chain: ResolvedChain,
    pub terminal: TerminalKind,
    pub cache_hit: bool,
    pub latency_ms: f64,
    pub latency: LatencyBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub poll_id: Option<String>,
    pub concentration: ConcentrationSnapshot,
    pub active_edge_count: u64,
    pub cache: CacheStats,
}

/// A claimed cache miss awaiting its walk.
struct PendingResolution {
    index: usize,
    key: CacheKey,
    generation: u64,
    cache_us: u64,
}

pub struct ResolutionService {
    store: Arc<dyn DelegationStore>,
    cache: Arc<ResolutionCache>,
    walker: GraphWalker,
    slo: SloMonitor,
    sink: Arc<dyn SignalSink>,
    config: EngineConfig,
}

impl ResolutionService {
    pub fn new(
        store: Arc<dyn DelegationStore>,
        cache: Arc<ResolutionCache>,
        sink: Arc<dyn SignalSink>,
        config: EngineConfig,
    ) -> Self {
        let slo = SloMonitor::new(
            Duration::from_millis(config.fast_path_budget_ms),
            Duration::from_millis(config.slow_path_budget_ms),
            config.deadline(),
            config.latency_window,
        );
        Self {
            store,
            cache,
            walker: GraphWalker::new(config.max_depth),
            slo,
            sink,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// `Resolve(delegator_id, poll_id?)`. Read-time anomalies come back as an
    /// unresolved terminal; only store failures are errors.
    pub fn resolve(&self, delegator_id: &str, poll_id: Option<&str>) -> Result<Resolution, EngineError> {
        let deadline = Deadline::new(self.config.deadline());
        let key = CacheKey::new(delegator_id, poll_id);
        let now = Utc::now();

        let cache_started = Instant::now();
        let lookup = self.cache.lookup(&key, now);
        let cache_us = micros(cache_started.elapsed());

        match lookup {
            Lookup::Hit(entry) => self.fast_path(&key, &entry, cache_us, &deadline),
            Lookup::Miss {
                generation,
                signals,
            } => {
                self.emit_signals(signals);
                tracing::debug!(key = %key, generation, "cache miss");
                self.slow_path(key, generation, cache_us, now, &deadline)
            }
        }
    }

    /// `resolve` with anonymous edges masked for external reporting.
    pub fn resolve_public(&self, delegator_id: &str, poll_id: Option<&str>) -> Result<Resolution, EngineError> {
        let mut resolution = self.resolve(delegator_id, poll_id)?;
        resolution.chain = resolution.chain.redacted(&self.config.anonymization_salt);
        Ok(resolution)
    }

    /// Vote-tally batch: hits are served from the cache, all misses share
    /// one store snapshot and are walked in parallel. Results follow the
    /// input order.
    pub fn resolve_many(
        &self,
        delegator_ids: &[String],
        poll_id: Option<&str>,
    ) -> Result<Vec<Resolution>, EngineError> {
        let deadline = Deadline::new(self.config.deadline());
        let now = Utc::now();
        let mut results: Vec<Option<Resolution>> = vec![None; delegator_ids.len()];
        let mut pending: Vec<PendingResolution> = Vec::new();

        for (index, delegator_id) in delegator_ids.iter().enumerate() {
            let key = CacheKey::new(delegator_id.as_str(), poll_id);
            let cache_started = Instant::now();
            let lookup = self.cache.lookup(&key, now);
            let cache_us = micros(cache_started.elapsed());
            match lookup {
                Lookup::Hit(entry) => {
                    results[index] = Some(self.fast_path(&key, &entry, cache_us, &deadline)?);
                }
                Lookup::Miss {
                    generation,
                    signals,
                } => {
                    self.emit_signals(signals);
                    pending.push(PendingResolution {
                        index,
                        key,
                        generation,
                        cache_us,
                    });
                }
            }
        }

        if !pending.is_empty() {
            let roots = pending.iter().map(|p| p.key.delegator_id.clone()).collect();
            let snapshot = match self.store.read_snapshot(&SnapshotRequest::for_resolution(roots, poll_id, now)) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    for p in &pending {
                        self.cache.abandon(&p.key, p.generation);
                    }
                    return Err(e);
                }
            };

            let gate = OverrideGate::new(&snapshot);
            let walker = self.walker;
            let walked: Vec<(WalkOutcome, u64)> = pending
                .par_iter()
                .map_init(WalkMemo::for_batch, |memo, p| {
                    let started = Instant::now();
                    let outcome = walk_one(&walker, &p.key.delegator_id, &snapshot, &gate, &deadline, memo);
                    (outcome, micros(started.elapsed()))
                })
                .collect();

            for (p, (outcome, walk_us)) in pending.into_iter().zip(walked) {
                let latency = LatencyBreakdown {
                    cache_us: p.cache_us,
                    db_us: micros(snapshot.stats.db_time),
                    walk_us,
                    query_count: snapshot.stats.query_count,
                    memo_hits: outcome.memo_hits,
                    ..LatencyBreakdown::default()
                };
                results[p.index] = Some(self.settle(p.key, p.generation, outcome, latency, &deadline)?);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    /// Concentration over live cached chains only: entries whose
    /// `valid_until` has passed are evicted before the snapshot is taken.
    pub fn stats(&self, poll_id: Option<&str>) -> Result<EngineStats, EngineError> {
        let now = Utc::now();
        let expired = self.cache.evict_expired(now);
        if !expired.evicted.is_empty() {
            tracing::debug!(expired = expired.evicted.len(), "evicted expired resolutions");
        }
        self.emit_signals(expired.signals);
        Ok(EngineStats {
            poll_id: poll_id.map(str::to_string),
            concentration: self.cache.monitor().snapshot(poll_id),
            active_edge_count: self.store.active_edge_count(poll_id, now)?,
            cache: self.cache.stats(),
        })
    }

    /// Administrative cache bust, one poll or all.
    pub fn invalidate_stats(&self, poll_id: Option<&str>) -> Vec<CacheKey> {
        let invalidation = self.cache.invalidate(poll_scope(poll_id));
        self.emit_signals(invalidation.signals);
        tracing::info!(
            poll = poll_id.unwrap_or("*"),
            evicted = invalidation.evicted.len(),
            "resolution cache busted"
        );
        invalidation.evicted
    }

    pub fn slo_report(&self) -> SloReport {
        self.slo.report()
    }

    /// Active edges `delegator_id` holds that apply to `poll_id`, newest
    /// first. Read straight from the store, never from the cache.
    pub fn outgoing_edges(
        &self,
        delegator_id: &str,
        poll_id: Option<&str>,
    ) -> Result<Vec<DelegationEdge>, EngineError> {
        self.store
            .active_edges(&[delegator_id.to_string()], poll_id, Utc::now())
    }

    pub fn target(&self, target: &TargetRef) -> Result<Option<TargetMetadata>, EngineError> {
        self.store.target_metadata(target)
    }

    pub fn has_direct_vote(&self, user_id: &str, poll_id: &str) -> Result<bool, EngineError> {
        override_gate::has_direct_vote(self.store.as_ref(), user_id, poll_id)
    }

    fn fast_path(
        &self,
        key: &CacheKey,
        entry: &CachedResolution,
        cache_us: u64,
        deadline: &Deadline,
    ) -> Result<Resolution, EngineError> {
        let decode_started = Instant::now();
        let chain = entry.decode()?;
        let deserialize_us = micros(decode_started.elapsed());
        tracing::debug!(key = %key, "cache hit");

        let elapsed = deadline.elapsed();
        self.record_slo(ResolutionPath::Fast, key, elapsed);
        let latency = LatencyBreakdown {
            cache_us,
            deserialize_us,
            total_us: micros(elapsed),
            ..LatencyBreakdown::default()
        };
        Ok(Resolution {
            terminal: chain.terminal.kind(),
            chain,
            cache_hit: true,
            latency_ms: latency.total_ms(),
            latency,
        })
    }

    fn slow_path(
        &self,
        key: CacheKey,
        generation: u64,
        cache_us: u64,
        now: DateTime<Utc>,
        deadline: &Deadline,
    ) -> Result<Resolution, EngineError> {
        let request = SnapshotRequest::for_resolution(vec![key.delegator_id.clone()], key.poll_id.as_deref(), now);
        let snapshot = match self.store.read_snapshot(&request) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.cache.abandon(&key, generation);
                return Err(e);
            }
        };

        let walk_started = Instant::now();
        let gate = OverrideGate::new(&snapshot);
        let mut memo = WalkMemo::default();
        let outcome = walk_one(&self.walker, &key.delegator_id, &snapshot, &gate, deadline, &mut memo);
        let latency = LatencyBreakdown {
            cache_us,
            db_us: micros(snapshot.stats.db_time),
            walk_us: micros(walk_started.elapsed()),
            query_count: snapshot.stats.query_count,
            memo_hits: outcome.memo_hits,
            ..LatencyBreakdown::default()
        };
        self.settle(key, generation, outcome, latency, deadline)
    }

    /// Publish a slow-path outcome: report anomalies, fill the cache (timeouts
    /// are never cached), record the SLO sample.
    fn settle(
        &self,
        key: CacheKey,
        generation: u64,
        outcome: WalkOutcome,
        mut latency: LatencyBreakdown,
        deadline: &Deadline,
    ) -> Result<Resolution, EngineError> {
        if let Some(node) = &outcome.cycle_at {
            tracing::warn!(key = %key, node = %node, "delegation cycle in stored data");
            self.sink.emit(GovernanceEvent::CycleViolation {
                delegator_id: key.delegator_id.clone(),
                poll_id: key.poll_id.clone(),
                node: node.clone(),
            });
        }

        if outcome.chain.terminal.unresolved_reason() == Some(UnresolvedReason::Timeout) {
            self.cache.abandon(&key, generation);
            self.slo.record_timeout();
            let elapsed_ms = deadline.elapsed().as_secs_f64() * 1000.0;
            tracing::warn!(key = %key, elapsed_ms, "resolution deadline exceeded");
            self.sink.emit(GovernanceEvent::ResolutionTimeout {
                delegator_id: key.delegator_id.clone(),
                poll_id: key.poll_id.clone(),
                elapsed_ms,
                deadline_ms: self.config.deadline_ms,
            });
        } else {
            let entry = match CachedResolution::from_chain(&outcome.chain, outcome.valid_until) {
                Ok(entry) => entry,
                Err(e) => {
                    self.cache.abandon(&key, generation);
                    return Err(e);
                }
            };
            let (put, signals) = self.cache.put(&key, generation, entry);
            if put == PutOutcome::Stored {
                tracing::debug!(key = %key, generation, "cache filled");
            }
            self.emit_signals(signals);
        }

        let elapsed = deadline.elapsed();
        self.record_slo(ResolutionPath::Slow, &key, elapsed);
        latency.total_us = micros(elapsed);
        let chain = outcome.chain;
        Ok(Resolution {
            terminal: chain.terminal.kind(),
            chain,
            cache_hit: false,
            latency_ms: latency.total_ms(),
            latency,
        })
    }

    fn record_slo(&self, path: ResolutionPath, key: &CacheKey, elapsed: Duration) {
        if let Some(budget) = self.slo.record(path, elapsed) {
            let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
            let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(key = %key, ?path, elapsed_ms, budget_ms, "latency budget breached");
            self.sink.emit(GovernanceEvent::SloBreach {
                path,
                delegator_id: key.delegator_id.clone(),
                poll_id: key.poll_id.clone(),
                elapsed_ms,
                budget_ms,
            });
        }
    }

    pub(crate) fn emit_signals(&self, signals: Vec<ConcentrationSignal>) {
        emit_concentration(self.sink.as_ref(), signals);
    }
}

/// Gate, then walk, under the deadline.
fn walk_one(
    walker: &GraphWalker,
    delegator_id: &str,
    snapshot: &EdgeSnapshot,
    gate: &OverrideGate<'_>,
    deadline: &Deadline,
    memo: &mut WalkMemo,
) -> WalkOutcome {
    if deadline.is_expired() {
        return WalkOutcome::settled(ResolvedChain::origin_only(
            delegator_id,
            snapshot.poll_id.as_deref(),
            Terminal::Unresolved {
                reason: UnresolvedReason::Timeout,
                at: Some(TargetRef::user(delegator_id)),
            },
        ));
    }
    match gate.intercept_origin(delegator_id) {
        Some(chain) => WalkOutcome::settled(chain),
        None => walker.walk(delegator_id, snapshot, gate, deadline, memo),
    }
}

pub(crate) fn emit_concentration(sink: &dyn SignalSink, signals: Vec<ConcentrationSignal>) {
    for signal in signals {
        tracing::warn!(
            poll = signal.poll_id.as_deref().unwrap_or("global"),
            target = %signal.target,
            share = signal.share,
            threshold = signal.threshold,
            "concentration soft cap crossed"
        );
        sink.emit(GovernanceEvent::ConcentrationSoftCap(signal));
    }
}
