//! Resolved chains: the derived, never-persisted answer to "who casts this
//! delegator's power on this poll".

use crate::engine::model::{DelegationEdge, DelegationMode, TargetKind, TargetRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Which selection rule produced a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopRule {
    /// A poll-specific edge for the resolved poll.
    PollSpecific,
    /// The global edge, used because no poll-specific edge exists.
    GlobalDefault,
    /// A poll-specific edge overriding the node's `hybrid_seed` global edge.
    HybridRefinement,
}

/// The edge a hop travelled along.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopEdge {
    pub edge_id: String,
    pub mode: DelegationMode,
    pub rule: HopRule,
    pub is_anonymous: bool,
}

impl HopEdge {
    pub fn from_edge(edge: &DelegationEdge, rule: HopRule) -> Self {
        Self {
            edge_id: edge.id.clone(),
            mode: edge.mode,
            rule,
            is_anonymous: edge.is_anonymous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHop {
    pub node: TargetRef,
    /// `None` for the first node (the delegator).
    pub via: Option<HopEdge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    Cycle,
    DepthExceeded,
    Timeout,
    Dangling,
}

impl UnresolvedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnresolvedReason::Cycle => "cycle",
            UnresolvedReason::DepthExceeded => "depth_exceeded",
            UnresolvedReason::Timeout => "timeout",
            UnresolvedReason::Dangling => "dangling",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "terminal", rename_all = "snake_case")]
pub enum Terminal {
    /// A user on the chain (possibly the delegator) voted directly.
    DirectVote { voter: String },
    /// Chain-following stopped at a target with no further active edge.
    Target { target: TargetRef },
    Unresolved {
        reason: UnresolvedReason,
        at: Option<TargetRef>,
    },
}

/// Flat terminal classification reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    DirectVote,
    Person,
    Value,
    Idea,
    Institution,
    Field,
    Unresolved,
}

impl Terminal {
    pub fn kind(&self) -> TerminalKind {
        match self {
            Terminal::DirectVote { .. } => TerminalKind::DirectVote,
            Terminal::Target { target } => match target.kind() {
                TargetKind::User => TerminalKind::Person,
                TargetKind::Value => TerminalKind::Value,
                TargetKind::Idea => TerminalKind::Idea,
                TargetKind::Institution => TerminalKind::Institution,
                TargetKind::Field => TerminalKind::Field,
            },
            Terminal::Unresolved { .. } => TerminalKind::Unresolved,
        }
    }

    /// The target that ends up casting the power, for concentration accounting.
    pub fn power_holder(&self) -> Option<TargetRef> {
        match self {
            Terminal::DirectVote { voter } => Some(TargetRef::user(voter.clone())),
            Terminal::Target { target } => Some(target.clone()),
            Terminal::Unresolved { .. } => None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, Terminal::Unresolved { .. })
    }

    pub fn unresolved_reason(&self) -> Option<UnresolvedReason> {
        match self {
            Terminal::Unresolved { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedChain {
    pub delegator_id: String,
    pub poll_id: Option<String>,
    pub hops: Vec<ChainHop>,
    pub terminal: Terminal,
}

impl ResolvedChain {
    /// A chain consisting of the delegator alone.
    pub fn origin_only(delegator_id: &str, poll_id: Option<&str>, terminal: Terminal) -> Self {
        Self {
            delegator_id: delegator_id.to_string(),
            poll_id: poll_id.map(str::to_string),
            hops: vec![ChainHop {
                node: TargetRef::user(delegator_id),
                via: None,
            }],
            terminal,
        }
    }

    /// Number of edges followed.
    pub fn depth(&self) -> usize {
        self.hops.len().saturating_sub(1)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TargetRef> {
        self.hops.iter().map(|h| &h.node)
    }

    /// Whether this resolution could change when `node` changes.
    pub fn depends_on(&self, node: &TargetRef) -> bool {
        self.nodes().any(|n| n == node)
            || matches!(&self.terminal, Terminal::Unresolved { at: Some(at), .. } if at == node)
    }

    pub fn has_anonymous_edge(&self) -> bool {
        self.hops
            .iter()
            .any(|h| h.via.as_ref().is_some_and(|e| e.is_anonymous))
    }

    /// Externally reportable copy: when any edge is anonymous the origin
    /// delegator is replaced by an opaque token, as is the delegator of
    /// every anonymous hop. Internal accounting keeps using `self`.
    pub fn redacted(&self, salt: &str) -> ResolvedChain {
        if !self.has_anonymous_edge() {
            return self.clone();
        }

        let mut masked: BTreeSet<String> = BTreeSet::new();
        masked.insert(self.delegator_id.clone());
        for pair in self.hops.windows(2) {
            let anonymous = pair[1].via.as_ref().is_some_and(|e| e.is_anonymous);
            if anonymous {
                if let Some(user) = pair[0].node.as_user() {
                    masked.insert(user.to_string());
                }
            }
        }

        let mask = |id: &str| -> String {
            if masked.contains(id) {
                opaque_token(salt, id)
            } else {
                id.to_string()
            }
        };

        let hops = self
            .hops
            .iter()
            .map(|hop| ChainHop {
                node: match &hop.node {
                    TargetRef::User(id) => TargetRef::User(mask(id)),
                    other => other.clone(),
                },
                via: hop.via.clone(),
            })
            .collect();

        let terminal = match &self.terminal {
            Terminal::DirectVote { voter } => Terminal::DirectVote { voter: mask(voter) },
            other => other.clone(),
        };

        ResolvedChain {
            delegator_id: mask(&self.delegator_id),
            poll_id: self.poll_id.clone(),
            hops,
            terminal,
        }
    }
}

/// Deterministic opaque stand-in for a user id.
pub fn opaque_token(salt: &str, id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([0u8]);
    hasher.update(id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("anon-{}", &digest[..16])
}
