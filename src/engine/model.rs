//! Delegation data model: targets, modes, edges and votes.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant of the unified-targets union.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    User,
    Value,
    Idea,
    Institution,
    Field,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::User => "user",
            TargetKind::Value => "value",
            TargetKind::Idea => "idea",
            TargetKind::Institution => "institution",
            TargetKind::Field => "field",
        }
    }

    pub fn from_kind_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TargetKind::User),
            "value" => Some(TargetKind::Value),
            "idea" => Some(TargetKind::Idea),
            "institution" => Some(TargetKind::Institution),
            "field" => Some(TargetKind::Field),
            _ => None,
        }
    }
}

/// A delegation target. Exactly one variant is ever set; only `User`
/// targets can delegate further.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TargetRef {
    User(String),
    Value(String),
    Idea(String),
    Institution(String),
    Field(String),
}

impl TargetRef {
    pub fn new(kind: TargetKind, id: impl Into<String>) -> Self {
        let id = id.into();
        match kind {
            TargetKind::User => TargetRef::User(id),
            TargetKind::Value => TargetRef::Value(id),
            TargetKind::Idea => TargetRef::Idea(id),
            TargetKind::Institution => TargetRef::Institution(id),
            TargetKind::Field => TargetRef::Field(id),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        TargetRef::User(id.into())
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            TargetRef::User(_) => TargetKind::User,
            TargetRef::Value(_) => TargetKind::Value,
            TargetRef::Idea(_) => TargetKind::Idea,
            TargetRef::Institution(_) => TargetKind::Institution,
            TargetRef::Field(_) => TargetKind::Field,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            TargetRef::User(id)
            | TargetRef::Value(id)
            | TargetRef::Idea(id)
            | TargetRef::Institution(id)
            | TargetRef::Field(id) => id,
        }
    }

    /// The user id when this target can delegate further.
    pub fn as_user(&self) -> Option<&str> {
        match self {
            TargetRef::User(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.id())
    }
}

/// Uniform `{id, active, name}` view over any target kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMetadata {
    pub target: TargetRef,
    pub name: String,
    /// False when the target is soft-deleted or flagged inactive.
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DelegationMode {
    LegacyFixedTerm,
    FlexibleDomain,
    HybridSeed,
}

impl DelegationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationMode::LegacyFixedTerm => "legacy_fixed_term",
            DelegationMode::FlexibleDomain => "flexible_domain",
            DelegationMode::HybridSeed => "hybrid_seed",
        }
    }

    pub fn from_mode_str(s: &str) -> Option<Self> {
        match s {
            "legacy_fixed_term" => Some(DelegationMode::LegacyFixedTerm),
            "flexible_domain" => Some(DelegationMode::FlexibleDomain),
            "hybrid_seed" => Some(DelegationMode::HybridSeed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationEdge {
    pub id: String,
    pub delegator_id: String,
    pub target: TargetRef,
    /// `None` for a global delegation.
    pub poll_id: Option<String>,
    pub mode: DelegationMode,
    pub is_anonymous: bool,
    pub created_at: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub chain_origin_id: String,
    pub is_deleted: bool,
}

impl DelegationEdge {
    pub fn is_global(&self) -> bool {
        self.poll_id.is_none()
    }

    /// Active iff not deleted, not revoked, and not past its end date.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_deleted && self.revoked_at.is_none() && self.end_date.is_none_or(|end| end > now)
    }
}

/// A delegation as requested by a caller, before validation and persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEdge {
    pub delegator_id: String,
    pub target: TargetRef,
    pub poll_id: Option<String>,
    pub mode: DelegationMode,
    pub is_anonymous: bool,
    /// Defaults to the creation time.
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl NewEdge {
    /// A global, non-anonymous `flexible_domain` delegation.
    pub fn new(delegator_id: impl Into<String>, target: TargetRef) -> Self {
        Self {
            delegator_id: delegator_id.into(),
            target,
            poll_id: None,
            mode: DelegationMode::FlexibleDomain,
            is_anonymous: false,
            start_date: None,
            end_date: None,
        }
    }

    pub fn for_poll(mut self, poll_id: impl Into<String>) -> Self {
        self.poll_id = Some(poll_id.into());
        self
    }

    pub fn with_mode(mut self, mode: DelegationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.is_anonymous = true;
        self
    }

    pub fn starting(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self
    }

    pub fn ending(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub user_id: String,
    pub poll_id: String,
    pub cast_at: DateTime<Utc>,
}

/// Cache and concentration key: one resolution per (delegator, poll).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub delegator_id: String,
    pub poll_id: Option<String>,
}

impl CacheKey {
    pub fn new(delegator_id: impl Into<String>, poll_id: Option<&str>) -> Self {
        Self {
            delegator_id: delegator_id.into(),
            poll_id: poll_id.map(str::to_string),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.delegator_id,
            self.poll_id.as_deref().unwrap_or("global")
        )
    }
}
