//! Concentration Monitor: per-poll power shares over cached resolutions.
//!
//! Tallies move only through the cache: `record_resolution` when an entry is
//! stored, `retract_resolution` when it is evicted. Request handlers never
//! write counters directly.

use crate::engine::chain::Terminal;
use crate::engine::events::ConcentrationSignal;
use crate::engine::model::TargetRef;
use dashmap::DashMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

pub const DEFAULT_THRESHOLD: f64 = 0.05;

#[derive(Debug, Default)]
struct PollTally {
    counts: FxHashMap<TargetRef, u64>,
    resolved: u64,
    unresolved: u64,
    above_cap: FxHashSet<TargetRef>,
}

impl PollTally {
    fn share(&self, target: &TargetRef) -> f64 {
        if self.resolved == 0 {
            return 0.0;
        }
        self.counts.get(target).copied().unwrap_or(0) as f64 / self.resolved as f64
    }

    fn is_empty(&self) -> bool {
        self.resolved == 0 && self.unresolved == 0
    }

    /// Fire on upward crossings; re-arm targets back at or under the cap.
    fn reevaluate(&mut self, poll_id: &Option<String>, threshold: f64) -> Vec<ConcentrationSignal> {
        let mut signals = Vec::new();
        let resolved = self.resolved;
        for (target, &count) in &self.counts {
            let share = count as f64 / resolved as f64;
            if share > threshold {
                if self.above_cap.insert(target.clone()) {
                    signals.push(ConcentrationSignal {
                        poll_id: poll_id.clone(),
                        target: target.clone(),
                        count,
                        total: resolved,
                        share,
                        threshold,
                    });
                }
            } else {
                self.above_cap.remove(target);
            }
        }
        let counts = &self.counts;
        self.above_cap.retain(|t| counts.contains_key(t));
        signals.sort_by(|a, b| a.target.cmp(&b.target));
        signals
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetShare {
    pub target: TargetRef,
    pub count: u64,
    pub share: f64,
    pub above_cap: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationSnapshot {
    pub poll_id: Option<String>,
    pub threshold: f64,
    pub resolved: u64,
    pub unresolved: u64,
    pub shares: Vec<TargetShare>,
}

pub struct ConcentrationMonitor {
    threshold: f64,
    polls: DashMap<Option<String>, PollTally>,
}

impl Default for ConcentrationMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl ConcentrationMonitor {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            polls: DashMap::new(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn record_resolution(&self, poll_id: Option<&str>, terminal: &Terminal) -> Vec<ConcentrationSignal> {
        let key = poll_id.map(str::to_string);
        let mut tally = self.polls.entry(key.clone()).or_default();
        match terminal.power_holder() {
            Some(target) => {
                *tally.counts.entry(target).or_insert(0) += 1;
                tally.resolved += 1;
                tally.reevaluate(&key, self.threshold)
            }
            None => {
                tally.unresolved += 1;
                Vec::new()
            }
        }
    }

    /// Undo one `record_resolution` for the same terminal.
    pub fn retract_resolution(&self, poll_id: Option<&str>, terminal: &Terminal) -> Vec<ConcentrationSignal> {
        let key = poll_id.map(str::to_string);
        let signals = {
            let Some(mut tally) = self.polls.get_mut(&key) else {
                tracing::debug!(poll = ?poll_id, "retraction for an untracked poll");
                return Vec::new();
            };
            match terminal.power_holder() {
                Some(target) => {
                    let emptied = match tally.counts.get_mut(&target) {
                        Some(count) => {
                            *count -= 1;
                            *count == 0
                        }
                        None => return Vec::new(),
                    };
                    if emptied {
                        tally.counts.remove(&target);
                    }
                    tally.resolved -= 1;
                    tally.reevaluate(&key, self.threshold)
                }
                None => {
                    tally.unresolved = tally.unresolved.saturating_sub(1);
                    Vec::new()
                }
            }
        };
        self.polls.remove_if(&key, |_, tally| tally.is_empty());
        signals
    }

    pub fn share(&self, poll_id: Option<&str>, target: &TargetRef) -> f64 {
        self.polls
            .get(&poll_id.map(str::to_string))
            .map(|tally| tally.share(target))
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self, poll_id: Option<&str>) -> ConcentrationSnapshot {
        let key = poll_id.map(str::to_string);
        let mut snapshot = ConcentrationSnapshot {
            poll_id: key.clone(),
            threshold: self.threshold,
            resolved: 0,
            unresolved: 0,
            shares: Vec::new(),
        };
        if let Some(tally) = self.polls.get(&key) {
            snapshot.resolved = tally.resolved;
            snapshot.unresolved = tally.unresolved;
            snapshot.shares = tally
                .counts
                .iter()
                .map(|(target, &count)| TargetShare {
                    target: target.clone(),
                    count,
                    share: tally.share(target),
                    above_cap: tally.above_cap.contains(target),
                })
                .collect();
        }
        snapshot.shares.sort_by(|a, b| {
            b.share
                .total_cmp(&a.share)
                .then_with(|| a.target.cmp(&b.target))
        });
        snapshot
    }

    /// Polls with at least one tallied resolution.
    pub fn polls(&self) -> Vec<Option<String>> {
        let mut polls: Vec<Option<String>> = self.polls.iter().map(|e| e.key().clone()).collect();
        polls.sort();
        polls
    }
}
