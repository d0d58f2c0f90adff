//! Graph Walker: resolves a (delegator, poll) pair over an edge snapshot.
//!
//! The walker is CPU-only. Everything it reads (edges, votes, target
//! metadata) is in the [`EdgeSnapshot`], loaded in one store round trip.
//!
//! Per hop, for poll `P`:
//! 1. a user who voted directly on `P` terminates the chain (`direct_vote`);
//! 2. otherwise the newest active poll-specific edge for `P` is followed;
//! 3. otherwise the newest active global edge is followed;
//! 4. otherwise the node is the terminal target.
//!
//! A revisited node ends the walk as `unresolved(cycle)`, more than
//! `max_depth` edges as `unresolved(depth_exceeded)`, and a terminal whose
//! target is missing, inactive or deleted as `unresolved(dangling)`.

use crate::engine::chain::{ChainHop, HopEdge, HopRule, ResolvedChain, Terminal, UnresolvedReason};
use crate::engine::latency::Deadline;
use crate::engine::model::{DelegationEdge, DelegationMode, TargetRef};
use crate::engine::override_gate::OverrideGate;
use crate::engine::store::EdgeSnapshot;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};

pub const DEFAULT_MAX_DEPTH: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct GraphWalker {
    max_depth: usize,
}

impl Default for GraphWalker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

#[derive(Debug, Clone)]
pub struct WalkOutcome {
    pub chain: ResolvedChain,
    /// Node at which a cycle in stored data was met.
    pub cycle_at: Option<TargetRef>,
    /// Earliest end date among the edges followed.
    pub valid_until: Option<DateTime<Utc>>,
    pub memo_hits: u64,
}

impl WalkOutcome {
    /// Outcome for a chain decided without walking (origin override).
    pub fn settled(chain: ResolvedChain) -> Self {
        Self {
            chain,
            cycle_at: None,
            valid_until: None,
            memo_hits: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Suffix {
    hops: Vec<ChainHop>,
    hop_ends: Vec<Option<DateTime<Utc>>>,
    terminal: Terminal,
}

/// Per-request memoization. Never shared across requests.
#[derive(Debug, Default)]
pub struct WalkMemo {
    selections: FxHashMap<String, Option<(DelegationEdge, HopRule)>>,
    suffixes: FxHashMap<String, Suffix>,
    record_suffixes: bool,
    hits: u64,
}

impl WalkMemo {
    /// Memo for batch requests: completed chain suffixes are reused across
    /// the delegators resolved by the same request.
    pub fn for_batch() -> Self {
        Self {
            record_suffixes: true,
            ..Self::default()
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}

impl GraphWalker {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// The edge `node` delegates along for the snapshot's poll, if any.
    pub fn select_edge<'s>(
        &self,
        node: &str,
        snapshot: &'s EdgeSnapshot,
    ) -> Option<(&'s DelegationEdge, HopRule)> {
        let active: Vec<&'s DelegationEdge> = snapshot
            .edges_from(node)
            .iter()
            .filter(|e| e.is_active_at(snapshot.now))
            .collect();
        let newest = |a: &&DelegationEdge, b: &&DelegationEdge| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        };

        if let Some(poll) = snapshot.poll_id.as_deref() {
            let specific = active
                .iter()
                .copied()
                .filter(|e| e.poll_id.as_deref() == Some(poll))
                .max_by(newest);
            if let Some(edge) = specific {
                let refines_seed = active
                    .iter()
                    .any(|e| e.is_global() && e.mode == DelegationMode::HybridSeed);
                let rule = if refines_seed {
                    HopRule::HybridRefinement
                } else {
                    HopRule::PollSpecific
                };
                return Some((edge, rule));
            }
        }

        active
            .into_iter()
            .filter(|e| e.is_global())
            .max_by(newest)
            .map(|edge| (edge, HopRule::GlobalDefault))
    }

    fn select_memoized(
        &self,
        node: &str,
        snapshot: &EdgeSnapshot,
        memo: &mut WalkMemo,
    ) -> Option<(DelegationEdge, HopRule)> {
        if let Some(selection) = memo.selections.get(node) {
            memo.hits += 1;
            return selection.clone();
        }
        let selection = self
            .select_edge(node, snapshot)
            .map(|(edge, rule)| (edge.clone(), rule));
        memo.selections.insert(node.to_string(), selection.clone());
        selection
    }

    /// Resolve `delegator_id` over `snapshot`. The gate is consulted at
    /// every user node, the delegator included.
    pub fn walk(
        &self,
        delegator_id: &str,
        snapshot: &EdgeSnapshot,
        gate: &OverrideGate<'_>,
        deadline: &Deadline,
        memo: &mut WalkMemo,
    ) -> WalkOutcome {
        let hits_before = memo.hits;
        let origin = TargetRef::user(delegator_id);
        let mut hops = vec![ChainHop {
            node: origin.clone(),
            via: None,
        }];
        let mut hop_ends: Vec<Option<DateTime<Utc>>> = vec![None];
        let mut visited: FxHashSet<TargetRef> = FxHashSet::default();
        visited.insert(origin);
        let mut current = delegator_id.to_string();
        let mut cycle_at = None;

        let terminal = loop {
            if deadline.is_expired() {
                break Terminal::Unresolved {
                    reason: UnresolvedReason::Timeout,
                    at: Some(TargetRef::user(current.as_str())),
                };
            }

            if let Some(suffix) = memo.suffixes.get(&current) {
                if self.can_splice(&hops, &visited, suffix) {
                    memo.hits += 1;
                    hops.extend(suffix.hops.iter().cloned());
                    hop_ends.extend(suffix.hop_ends.iter().copied());
                    break suffix.terminal.clone();
                }
            }

            if gate.has_direct_vote(&current) {
                break Terminal::DirectVote {
                    voter: current.clone(),
                };
            }

            let Some((edge, rule)) = self.select_memoized(&current, snapshot, memo) else {
                break classify_terminal(TargetRef::user(current.as_str()), snapshot);
            };

            if hops.len() - 1 >= self.max_depth {
                break Terminal::Unresolved {
                    reason: UnresolvedReason::DepthExceeded,
                    at: Some(edge.target.clone()),
                };
            }

            let next = edge.target.clone();
            if visited.contains(&next) {
                cycle_at = Some(next.clone());
                break Terminal::Unresolved {
                    reason: UnresolvedReason::Cycle,
                    at: Some(next),
                };
            }
            visited.insert(next.clone());
            hops.push(ChainHop {
                node: next.clone(),
                via: Some(HopEdge::from_edge(&edge, rule)),
            });
            hop_ends.push(edge.end_date);

            match next {
                TargetRef::User(id) => current = id,
                other => break classify_terminal(other, snapshot),
            }
        };

        if memo.record_suffixes && is_position_independent(&terminal) {
            for (i, hop) in hops.iter().enumerate() {
                if let TargetRef::User(id) = &hop.node {
                    if !memo.suffixes.contains_key(id) {
                        memo.suffixes.insert(
                            id.clone(),
                            Suffix {
                                hops: hops[i + 1..].to_vec(),
                                hop_ends: hop_ends[i + 1..].to_vec(),
                                terminal: terminal.clone(),
                            },
                        );
                    }
                }
            }
        }

        let valid_until = hop_ends.iter().flatten().min().copied();
        WalkOutcome {
            chain: ResolvedChain {
                delegator_id: delegator_id.to_string(),
                poll_id: snapshot.poll_id.clone(),
                hops,
                terminal,
            },
            cycle_at,
            valid_until,
            memo_hits: memo.hits - hits_before,
        }
    }

    fn can_splice(&self, hops: &[ChainHop], visited: &FxHashSet<TargetRef>, suffix: &Suffix) -> bool {
        hops.len() - 1 + suffix.hops.len() <= self.max_depth
            && suffix.hops.iter().all(|h| !visited.contains(&h.node))
    }

    /// Write-time dry run: would adding `delegator_id -> target` close a
    /// cycle? Follows every user-to-user edge in `snapshot` (not only the
    /// ones resolution would select) from `target` looking for the delegator.
    pub fn would_create_cycle(
        &self,
        delegator_id: &str,
        target: &TargetRef,
        snapshot: &EdgeSnapshot,
    ) -> bool {
        let Some(start) = target.as_user() else {
            return false;
        };
        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            if node == delegator_id {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            for edge in snapshot.edges_from(node) {
                if !edge.is_active_at(snapshot.now) {
                    continue;
                }
                if let Some(next) = edge.target.as_user() {
                    stack.push(next);
                }
            }
        }
        false
    }
}

fn classify_terminal(target: TargetRef, snapshot: &EdgeSnapshot) -> Terminal {
    match snapshot.metadata(&target) {
        Some(meta) if meta.is_active => Terminal::Target { target },
        _ => {
            tracing::debug!(target = %target, "terminal target is missing or inactive");
            Terminal::Unresolved {
                reason: UnresolvedReason::Dangling,
                at: Some(target),
            }
        }
    }
}

/// Terminals that do not depend on the path that reached them.
fn is_position_independent(terminal: &Terminal) -> bool {
    match terminal {
        Terminal::DirectVote { .. } | Terminal::Target { .. } => true,
        Terminal::Unresolved { reason, .. } => *reason == UnresolvedReason::Dangling,
    }
}
