//! The write path: every mutation of edges, votes and targets.
//!
//! Each operation commits through the broker (serialized, `BEGIN IMMEDIATE`,
//! audited), then synchronously invalidates the cache keys whose resolution
//! could change, then returns. Every `resolve` that starts after the call
//! returns `Ok` reflects the write. A `resolve` overlapping the call may
//! still serve the previous cached answer between commit and invalidation.

use crate::core::broker::DbBroker;
use crate::core::config::EngineConfig;
use crate::core::error::EngineError;
use crate::core::time;
use crate::engine::cache::{self, Invalidation, ResolutionCache};
use crate::engine::events::SignalSink;
use crate::engine::model::{CacheKey, DelegationEdge, DelegationMode, NewEdge, TargetRef, Vote};
use crate::engine::service::emit_concentration;
use crate::engine::sqlite;
use crate::engine::store::{EdgeScope, SnapshotRequest};
use crate::engine::walker::GraphWalker;
use chrono::{DateTime, Months, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Actor recorded in the broker audit log.
const BROKER_ACTOR: &str = "engine";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeReceipt {
    pub edge: DelegationEdge,
    pub invalidated: Vec<CacheKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub vote: Vote,
    /// False when the (user, poll) vote already existed.
    pub newly_cast: bool,
    pub invalidated: Vec<CacheKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: Vec<DelegationEdge>,
    pub watermark: DateTime<Utc>,
    pub invalidated: Vec<CacheKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReceipt {
    pub target: TargetRef,
    pub invalidated: Vec<CacheKey>,
}

pub struct DelegationLedger {
    broker: DbBroker,
    db_path: PathBuf,
    cache: Arc<ResolutionCache>,
    sink: Arc<dyn SignalSink>,
    walker: GraphWalker,
    config: EngineConfig,
}

impl DelegationLedger {
    pub fn new(
        root: &Path,
        db_path: &Path,
        cache: Arc<ResolutionCache>,
        sink: Arc<dyn SignalSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            broker: DbBroker::new(root),
            db_path: db_path.to_path_buf(),
            cache,
            sink,
            walker: GraphWalker::new(config.max_depth),
            config,
        }
    }

    fn write<F, R>(&self, op: &str, mut f: F) -> Result<R, EngineError>
    where
        F: FnMut(&Connection) -> Result<R, EngineError>,
    {
        self.broker
            .with_conn(&self.db_path, BROKER_ACTOR, None, op, |conn| {
                let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
                let out = f(&tx)?;
                tx.commit()?;
                Ok(out)
            })
    }

    fn publish(&self, invalidation: Invalidation) -> Vec<CacheKey> {
        emit_concentration(self.sink.as_ref(), invalidation.signals);
        invalidation.evicted
    }

    pub fn create_edge(&self, new: &NewEdge) -> Result<EdgeReceipt, EngineError> {
        self.create_edge_at(new, Utc::now())
    }

    /// Validate, persist and announce a new delegation. Rejections, in order:
    /// `InvalidTarget`, `CycleDetected` (self), `InvalidWindow`,
    /// `LegacyTermExceeded`, `DelegationLimitExceeded`, `CycleDetected`.
    pub fn create_edge_at(&self, new: &NewEdge, now: DateTime<Utc>) -> Result<EdgeReceipt, EngineError> {
        let id = time::new_event_id();
        let edge = self.write("delegation.create", |conn| {
            let edge = self.validate_new_edge(conn, new, &id, now)?;
            sqlite::insert_edge(conn, &edge)?;
            Ok(edge)
        })?;

        let invalidated = self.publish(self.cache.invalidate(cache::edge_write_scope(
            &TargetRef::user(edge.delegator_id.as_str()),
            edge.poll_id.as_deref(),
        )));
        tracing::info!(
            edge_id = %edge.id,
            delegator = %edge.delegator_id,
            target = %edge.target,
            poll = edge.poll_id.as_deref().unwrap_or("global"),
            mode = edge.mode.as_str(),
            invalidated = invalidated.len(),
            "delegation created"
        );
        Ok(EdgeReceipt { edge, invalidated })
    }

    fn validate_new_edge(
        &self,
        conn: &Connection,
        new: &NewEdge,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<DelegationEdge, EngineError> {
        match sqlite::target_metadata_in(conn, &new.target)? {
            Some(meta) if meta.is_active => {}
            Some(_) => {
                return Err(EngineError::InvalidTarget(format!("{} is inactive", new.target)));
            }
            None => {
                return Err(EngineError::InvalidTarget(format!("{} does not exist", new.target)));
            }
        }

        if new.target.as_user() == Some(new.delegator_id.as_str()) {
            return Err(self.cycle_error(new));
        }

        let start = new.start_date.unwrap_or(now);
        if let Some(end) = new.end_date {
            if end <= start {
                return Err(EngineError::InvalidWindow(format!(
                    "end_date {} is not after start_date {}",
                    end.to_rfc3339(),
                    start.to_rfc3339()
                )));
            }
        }

        if new.mode == DelegationMode::LegacyFixedTerm {
            let cap = start.checked_add_months(Months::new(self.config.legacy_term_years.saturating_mul(12)));
            let within_cap = match (new.end_date, cap) {
                (Some(end), Some(cap)) => end <= cap,
                _ => false,
            };
            if !within_cap {
                return Err(EngineError::LegacyTermExceeded {
                    edge_start: start.to_rfc3339(),
                    edge_end: new
                        .end_date
                        .map(|e| e.to_rfc3339())
                        .unwrap_or_else(|| "open-ended".to_string()),
                });
            }
        }

        let limit = self.config.max_active_edges_per_delegator;
        if sqlite::count_active_edges_of(conn, &new.delegator_id, now)? >= limit {
            return Err(EngineError::DelegationLimitExceeded {
                delegator: new.delegator_id.clone(),
                limit,
            });
        }

        if let Some(target_user) = new.target.as_user() {
            let request = SnapshotRequest {
                roots: vec![target_user.to_string()],
                poll_id: None,
                scope: EdgeScope::for_cycle_check(new.poll_id.as_deref()),
                now,
            };
            let reachable = sqlite::read_snapshot_in(conn, &request)?;
            if self
                .walker
                .would_create_cycle(&new.delegator_id, &new.target, &reachable)
            {
                return Err(self.cycle_error(new));
            }
        }

        let chain_origin_id =
            sqlite::upstream_origin(conn, &new.delegator_id, new.poll_id.as_deref(), now)?
                .unwrap_or_else(|| id.to_string());

        Ok(DelegationEdge {
            id: id.to_string(),
            delegator_id: new.delegator_id.clone(),
            target: new.target.clone(),
            poll_id: new.poll_id.clone(),
            mode: new.mode,
            is_anonymous: new.is_anonymous,
            created_at: now,
            start_date: start,
            end_date: new.end_date,
            revoked_at: None,
            chain_origin_id,
            is_deleted: false,
        })
    }

    fn cycle_error(&self, new: &NewEdge) -> EngineError {
        tracing::info!(
            delegator = %new.delegator_id,
            target = %new.target,
            "rejecting delegation that would close a cycle"
        );
        EngineError::CycleDetected {
            delegator: new.delegator_id.clone(),
            target: new.target.to_string(),
            poll_id: new.poll_id.clone(),
        }
    }

    pub fn revoke_edge(&self, edge_id: &str) -> Result<EdgeReceipt, EngineError> {
        self.revoke_edge_at(edge_id, Utc::now())
    }

    /// Revoking an already revoked edge is a no-op that still reports the edge.
    pub fn revoke_edge_at(&self, edge_id: &str, now: DateTime<Utc>) -> Result<EdgeReceipt, EngineError> {
        let edge = self.write("delegation.revoke", |conn| {
            let mut edge = live_edge(conn, edge_id)?;
            if sqlite::mark_revoked(conn, edge_id, now)? {
                edge.revoked_at = Some(now);
            }
            Ok(edge)
        })?;
        let invalidated = self.invalidate_edge(&edge);
        tracing::info!(edge_id, delegator = %edge.delegator_id, invalidated = invalidated.len(), "delegation revoked");
        Ok(EdgeReceipt { edge, invalidated })
    }

    /// Soft delete.
    pub fn delete_edge(&self, edge_id: &str) -> Result<EdgeReceipt, EngineError> {
        let edge = self.write("delegation.delete", |conn| {
            let mut edge = live_edge(conn, edge_id)?;
            sqlite::mark_deleted(conn, edge_id)?;
            edge.is_deleted = true;
            Ok(edge)
        })?;
        let invalidated = self.invalidate_edge(&edge);
        tracing::info!(edge_id, delegator = %edge.delegator_id, invalidated = invalidated.len(), "delegation deleted");
        Ok(EdgeReceipt { edge, invalidated })
    }

    fn invalidate_edge(&self, edge: &DelegationEdge) -> Vec<CacheKey> {
        self.publish(self.cache.invalidate(cache::edge_write_scope(
            &TargetRef::user(edge.delegator_id.as_str()),
            edge.poll_id.as_deref(),
        )))
    }

    pub fn cast_vote(&self, user_id: &str, poll_id: &str) -> Result<VoteReceipt, EngineError> {
        self.cast_vote_at(user_id, poll_id, Utc::now())
    }

    /// Idempotent per (user, poll). Invalidation runs either way.
    pub fn cast_vote_at(&self, user_id: &str, poll_id: &str, now: DateTime<Utc>) -> Result<VoteReceipt, EngineError> {
        if user_id.is_empty() || poll_id.is_empty() {
            return Err(EngineError::ValidationError(
                "vote requires a user id and a poll id".to_string(),
            ));
        }
        let newly_cast = self.write("vote.cast", |conn| sqlite::insert_vote(conn, user_id, poll_id, now))?;
        let invalidated = self.publish(self.cache.invalidate(cache::vote_scope(user_id, poll_id)));
        tracing::info!(user = user_id, poll = poll_id, newly_cast, invalidated = invalidated.len(), "direct vote cast");
        Ok(VoteReceipt {
            vote: Vote {
                user_id: user_id.to_string(),
                poll_id: poll_id.to_string(),
                cast_at: now,
            },
            newly_cast,
            invalidated,
        })
    }

    /// Announce every edge whose `end_date` passed since the last sweep,
    /// then move the watermark to `now`.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let (expired, watermark) = self.write("delegation.sweep", |conn| {
            let after = sqlite::expiry_watermark(conn)?.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            if now <= after {
                return Ok((Vec::new(), after));
            }
            let expired = sqlite::edges_expired_between(conn, after, now)?;
            sqlite::set_expiry_watermark(conn, now)?;
            Ok((expired, now))
        })?;

        let scopes: Vec<(TargetRef, Option<String>)> = expired
            .iter()
            .map(|e| (TargetRef::user(e.delegator_id.as_str()), e.poll_id.clone()))
            .collect();
        let invalidated = if scopes.is_empty() {
            Vec::new()
        } else {
            self.publish(self.cache.invalidate(|key, entry| {
                scopes.iter().any(|(node, poll)| {
                    cache::edge_write_scope(node, poll.as_deref())(key, entry)
                })
            }))
        };
        tracing::info!(
            expired = expired.len(),
            invalidated = invalidated.len(),
            watermark = %watermark.to_rfc3339(),
            "expiry sweep"
        );
        Ok(SweepReport {
            expired,
            watermark,
            invalidated,
        })
    }

    /// Create or re-activate a target in the unified-targets table.
    pub fn register_target(&self, target: &TargetRef, name: &str) -> Result<TargetReceipt, EngineError> {
        if target.id().is_empty() {
            return Err(EngineError::ValidationError("target id is empty".to_string()));
        }
        self.write("target.register", |conn| sqlite::upsert_target(conn, target, name))?;
        let invalidated = self.publish(self.cache.invalidate(cache::target_scope(target)));
        tracing::info!(target = %target, invalidated = invalidated.len(), "target registered");
        Ok(TargetReceipt {
            target: target.clone(),
            invalidated,
        })
    }

    pub fn set_target_active(&self, target: &TargetRef, active: bool) -> Result<TargetReceipt, EngineError> {
        let found = self.write("target.set_active", |conn| sqlite::update_target_active(conn, target, active))?;
        if !found {
            return Err(EngineError::NotFound(format!("target {target}")));
        }
        let invalidated = self.publish(self.cache.invalidate(cache::target_scope(target)));
        tracing::info!(target = %target, active, invalidated = invalidated.len(), "target activity changed");
        Ok(TargetReceipt {
            target: target.clone(),
            invalidated,
        })
    }
}

fn live_edge(conn: &Connection, edge_id: &str) -> Result<DelegationEdge, EngineError> {
    match sqlite::edge_by_id(conn, edge_id)? {
        Some(edge) if !edge.is_deleted => Ok(edge),
        _ => Err(EngineError::NotFound(format!("delegation {edge_id}"))),
    }
}
