//! Override Gate: a direct vote preempts every delegation for that voter and
//! poll, at the origin and at every hop.

use crate::core::error::EngineError;
use crate::engine::chain::{ResolvedChain, Terminal};
use crate::engine::store::{DelegationStore, EdgeSnapshot};
use rustc_hash::FxHashSet;

/// Vote check bound to one snapshot, so the origin check, the per-hop checks
/// and the edges walked all come from the same store read.
pub struct OverrideGate<'a> {
    poll_id: Option<&'a str>,
    voters: &'a FxHashSet<String>,
}

impl<'a> OverrideGate<'a> {
    pub fn new(snapshot: &'a EdgeSnapshot) -> Self {
        Self {
            poll_id: snapshot.poll_id.as_deref(),
            voters: snapshot.voters(),
        }
    }

    /// Global resolution has no poll to vote on and is never intercepted.
    pub fn has_direct_vote(&self, user_id: &str) -> bool {
        self.poll_id.is_some() && self.voters.contains(user_id)
    }

    /// Short-circuit before walking: the delegator voted, the chain is just them.
    pub fn intercept_origin(&self, delegator_id: &str) -> Option<ResolvedChain> {
        self.has_direct_vote(delegator_id).then(|| {
            ResolvedChain::origin_only(
                delegator_id,
                self.poll_id,
                Terminal::DirectVote {
                    voter: delegator_id.to_string(),
                },
            )
        })
    }
}

/// Direct-vote check against the store itself, outside any snapshot.
pub fn has_direct_vote(
    store: &dyn DelegationStore,
    user_id: &str,
    poll_id: &str,
) -> Result<bool, EngineError> {
    store.has_vote(user_id, poll_id)
}
