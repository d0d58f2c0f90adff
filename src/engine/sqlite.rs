//! SQLite implementation of the Delegation Store.
//!
//! Reads open a fresh connection and run inside one deferred transaction, so
//! every query of a snapshot sees the same WAL read mark. The reachable edge
//! set is loaded with a single recursive CTE; votes and target metadata for
//! the reached nodes follow in the same transaction.
//!
//! The `pub(crate)` helpers take a bare `&Connection` and are shared with the
//! write path, which runs them inside its own `BEGIN IMMEDIATE` transaction.

use crate::core::db;
use crate::core::error::EngineError;
use crate::core::pool;
use crate::core::schemas;
use crate::core::time::{from_unix, to_unix};
use crate::engine::model::{DelegationEdge, DelegationMode, TargetKind, TargetMetadata, TargetRef};
use crate::engine::store::{DelegationStore, EdgeScope, EdgeSnapshot, SnapshotRequest};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Bound parameters per statement for IN lists.
const MAX_BATCH: usize = 400;

const EDGE_COLUMNS: &str = "d.id, d.delegator_id, d.target_kind, d.target_id, d.poll_id, d.mode, \
     d.is_anonymous, d.created_at, d.start_date, d.end_date, d.revoked_at, d.chain_origin_id, \
     d.is_deleted";

/// `?1` = now (unix seconds).
const ACTIVE_CLAUSE: &str =
    "d.is_deleted = 0 AND d.revoked_at IS NULL AND (d.end_date IS NULL OR d.end_date > ?1)";

/// `?2` = scope code, `?3` = scope poll.
const SCOPE_CLAUSE: &str = "(d.poll_id IS NULL OR ?2 = 2 OR (?2 = 1 AND d.poll_id = ?3))";

pub struct SqliteDelegationStore {
    db_path: PathBuf,
}

impl SqliteDelegationStore {
    /// Open (and initialize, if needed) the store under `root`.
    pub fn open(root: &Path) -> Result<Self, EngineError> {
        db::initialize_delegation_db(root)?;
        Ok(Self {
            db_path: db::delegation_db_path(root),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn with_snapshot_read<F, R>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&Connection) -> Result<R, EngineError>,
    {
        pool::global_pool().with_read(&self.db_path, |conn| {
            let tx = conn.unchecked_transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }
}

impl DelegationStore for SqliteDelegationStore {
    fn read_snapshot(&self, request: &SnapshotRequest) -> Result<EdgeSnapshot, EngineError> {
        let started = Instant::now();
        let mut snapshot = self.with_snapshot_read(|conn| read_snapshot_in(conn, request))?;
        snapshot.stats.db_time = started.elapsed();
        tracing::debug!(
            roots = request.roots.len(),
            edges = snapshot.edge_count(),
            queries = snapshot.stats.query_count,
            db_us = snapshot.stats.db_time.as_micros() as u64,
            "read edge snapshot"
        );
        Ok(snapshot)
    }

    fn active_edges(
        &self,
        nodes: &[String],
        poll_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<DelegationEdge>, EngineError> {
        let scope = EdgeScope::for_resolution(poll_id);
        self.with_snapshot_read(|conn| {
            let mut out = Vec::new();
            for chunk in nodes.chunks(MAX_BATCH) {
                let sql = format!(
                    "SELECT {EDGE_COLUMNS} FROM delegations d \
                     WHERE {ACTIVE_CLAUSE} AND {SCOPE_CLAUSE} AND d.delegator_id IN ({}) \
                     ORDER BY d.delegator_id, d.created_at DESC, d.id DESC",
                    placeholders(4, chunk.len())
                );
                let mut args = scope_args(now, &scope);
                args.extend(chunk.iter().cloned().map(Value::Text));
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(args), edge_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            Ok(out)
        })
    }

    fn has_vote(&self, user_id: &str, poll_id: &str) -> Result<bool, EngineError> {
        pool::global_pool().with_read(&self.db_path, |conn| has_vote_in(conn, user_id, poll_id))
    }

    fn target_metadata(&self, target: &TargetRef) -> Result<Option<TargetMetadata>, EngineError> {
        pool::global_pool().with_read(&self.db_path, |conn| target_metadata_in(conn, target))
    }

    fn active_edge_count(&self, poll_id: Option<&str>, now: DateTime<Utc>) -> Result<u64, EngineError> {
        pool::global_pool().with_read(&self.db_path, |conn| {
            let count: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM delegations d WHERE {ACTIVE_CLAUSE} \
                     AND (?2 IS NULL OR d.poll_id IS NULL OR d.poll_id = ?2)"
                ),
                params![to_unix(now), poll_id],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn scope_args(now: DateTime<Utc>, scope: &EdgeScope) -> Vec<Value> {
    let (code, poll) = match scope {
        EdgeScope::GlobalOnly => (0, Value::Null),
        EdgeScope::Poll(p) => (1, Value::Text(p.clone())),
        EdgeScope::AnyPoll => (2, Value::Null),
    };
    vec![Value::Integer(to_unix(now)), Value::Integer(code), poll]
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn target_from_columns(row: &Row<'_>, kind_idx: usize, id_idx: usize) -> rusqlite::Result<TargetRef> {
    let kind: String = row.get(kind_idx)?;
    let id: String = row.get(id_idx)?;
    let kind = TargetKind::from_kind_str(&kind)
        .ok_or_else(|| conversion_error(kind_idx, format!("unknown target kind '{kind}'")))?;
    Ok(TargetRef::new(kind, id))
}

pub(crate) fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<DelegationEdge> {
    let mode: String = row.get(5)?;
    let mode = DelegationMode::from_mode_str(&mode)
        .ok_or_else(|| conversion_error(5, format!("unknown delegation mode '{mode}'")))?;
    Ok(DelegationEdge {
        id: row.get(0)?,
        delegator_id: row.get(1)?,
        target: target_from_columns(row, 2, 3)?,
        poll_id: row.get(4)?,
        mode,
        is_anonymous: row.get::<_, i64>(6)? != 0,
        created_at: from_unix(row.get(7)?),
        start_date: from_unix(row.get(8)?),
        end_date: row.get::<_, Option<i64>>(9)?.map(from_unix),
        revoked_at: row.get::<_, Option<i64>>(10)?.map(from_unix),
        chain_origin_id: row.get(11)?,
        is_deleted: row.get::<_, i64>(12)? != 0,
    })
}

/// The whole snapshot read, against an open transaction.
pub(crate) fn read_snapshot_in(conn: &Connection, request: &SnapshotRequest) -> Result<EdgeSnapshot, EngineError> {
    let mut snapshot = EdgeSnapshot::new(request.poll_id.as_deref(), request.now);
    let mut queries = 0u32;

    let mut roots: Vec<String> = request.roots.clone();
    roots.sort();
    roots.dedup();

    // Roots that voted are answered by the gate; their edges are never read.
    let mut expand = roots.clone();
    if let Some(poll) = request.poll_id.as_deref() {
        for voter in voters_among(conn, poll, &roots, &mut queries)? {
            snapshot.insert_voter(voter);
        }
        expand.retain(|r| !snapshot.voters().contains(r));
    }

    if !expand.is_empty() {
        for edge in reachable_edges(conn, &expand, &request.scope, request.now, &mut queries)? {
            snapshot.insert_edge(edge);
        }
    }

    let mut users: FxHashSet<String> = FxHashSet::default();
    let mut targets: FxHashSet<TargetRef> = expand.iter().map(|r| TargetRef::user(r.as_str())).collect();
    for edge in snapshot.edges() {
        if let Some(user) = edge.target.as_user() {
            if roots.binary_search_by(|r| r.as_str().cmp(user)).is_err() {
                users.insert(user.to_string());
            }
        }
        targets.insert(edge.target.clone());
    }

    if let Some(poll) = request.poll_id.as_deref() {
        let mut users: Vec<String> = users.into_iter().collect();
        users.sort();
        for voter in voters_among(conn, poll, &users, &mut queries)? {
            snapshot.insert_voter(voter);
        }
    }

    let mut targets: Vec<TargetRef> = targets.into_iter().collect();
    targets.sort();
    for meta in metadata_among(conn, &targets, &mut queries)? {
        snapshot.insert_metadata(meta);
    }

    snapshot.stats.query_count = queries;
    Ok(snapshot)
}

fn voters_among(
    conn: &Connection,
    poll_id: &str,
    users: &[String],
    queries: &mut u32,
) -> Result<Vec<String>, EngineError> {
    let mut out = Vec::new();
    for chunk in users.chunks(MAX_BATCH) {
        let sql = format!(
            "SELECT user_id FROM votes WHERE poll_id = ?1 AND user_id IN ({})",
            placeholders(2, chunk.len())
        );
        let mut args = vec![Value::Text(poll_id.to_string())];
        args.extend(chunk.iter().cloned().map(Value::Text));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;
        for row in rows {
            out.push(row?);
        }
        *queries += 1;
    }
    Ok(out)
}

/// Every active edge reachable from `roots` within `scope`, one round trip
/// per batch of roots.
fn reachable_edges(
    conn: &Connection,
    roots: &[String],
    scope: &EdgeScope,
    now: DateTime<Utc>,
    queries: &mut u32,
) -> Result<Vec<DelegationEdge>, EngineError> {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut out = Vec::new();
    for chunk in roots.chunks(MAX_BATCH) {
        let seeds = (4..4 + chunk.len())
            .map(|i| format!("(?{i})"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "WITH RECURSIVE reach(node) AS ( \
                 VALUES {seeds} \
                 UNION \
                 SELECT d.target_id FROM delegations d JOIN reach r ON d.delegator_id = r.node \
                 WHERE d.target_kind = 'user' AND {ACTIVE_CLAUSE} AND {SCOPE_CLAUSE} \
             ) \
             SELECT {EDGE_COLUMNS} FROM delegations d JOIN reach r ON d.delegator_id = r.node \
             WHERE {ACTIVE_CLAUSE} AND {SCOPE_CLAUSE}"
        );
        let mut args = scope_args(now, scope);
        args.extend(chunk.iter().cloned().map(Value::Text));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), edge_from_row)?;
        for row in rows {
            let edge = row?;
            if seen.insert(edge.id.clone()) {
                out.push(edge);
            }
        }
        *queries += 1;
    }
    Ok(out)
}

fn metadata_among(
    conn: &Connection,
    targets: &[TargetRef],
    queries: &mut u32,
) -> Result<Vec<TargetMetadata>, EngineError> {
    let mut out = Vec::new();
    for chunk in targets.chunks(MAX_BATCH / 2) {
        let pairs = (0..chunk.len())
            .map(|i| format!("(?{}, ?{})", 2 * i + 1, 2 * i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT target_kind, target_id, name, is_active, is_deleted FROM targets \
             WHERE (target_kind, target_id) IN (VALUES {pairs})"
        );
        let args: Vec<Value> = chunk
            .iter()
            .flat_map(|t| {
                [
                    Value::Text(t.kind().as_str().to_string()),
                    Value::Text(t.id().to_string()),
                ]
            })
            .collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), metadata_from_row)?;
        for row in rows {
            out.push(row?);
        }
        *queries += 1;
    }
    Ok(out)
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<TargetMetadata> {
    let is_active: i64 = row.get(3)?;
    let is_deleted: i64 = row.get(4)?;
    Ok(TargetMetadata {
        target: target_from_columns(row, 0, 1)?,
        name: row.get(2)?,
        is_active: is_active != 0 && is_deleted == 0,
    })
}

pub(crate) fn has_vote_in(conn: &Connection, user_id: &str, poll_id: &str) -> Result<bool, EngineError> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM votes WHERE user_id = ?1 AND poll_id = ?2)",
        params![user_id, poll_id],
        |row| row.get::<_, bool>(0),
    )?)
}

pub(crate) fn target_metadata_in(
    conn: &Connection,
    target: &TargetRef,
) -> Result<Option<TargetMetadata>, EngineError> {
    Ok(conn
        .query_row(
            "SELECT target_kind, target_id, name, is_active, is_deleted FROM targets \
             WHERE target_kind = ?1 AND target_id = ?2",
            params![target.kind().as_str(), target.id()],
            metadata_from_row,
        )
        .optional()?)
}

pub(crate) fn edge_by_id(conn: &Connection, edge_id: &str) -> Result<Option<DelegationEdge>, EngineError> {
    Ok(conn
        .query_row(
            &format!("SELECT {EDGE_COLUMNS} FROM delegations d WHERE d.id = ?1"),
            params![edge_id],
            edge_from_row,
        )
        .optional()?)
}

pub(crate) fn insert_edge(conn: &Connection, edge: &DelegationEdge) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO delegations (id, delegator_id, target_kind, target_id, poll_id, mode, \
         is_anonymous, created_at, start_date, end_date, revoked_at, chain_origin_id, is_deleted) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            edge.id,
            edge.delegator_id,
            edge.target.kind().as_str(),
            edge.target.id(),
            edge.poll_id,
            edge.mode.as_str(),
            edge.is_anonymous as i64,
            to_unix(edge.created_at),
            to_unix(edge.start_date),
            edge.end_date.map(to_unix),
            edge.revoked_at.map(to_unix),
            edge.chain_origin_id,
            edge.is_deleted as i64,
        ],
    )?;
    Ok(())
}

pub(crate) fn count_active_edges_of(
    conn: &Connection,
    delegator_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, EngineError> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM delegations d WHERE {ACTIVE_CLAUSE} AND d.delegator_id = ?2"),
        params![to_unix(now), delegator_id],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// Origin of the oldest active edge delegating into `delegator_id` in a scope
/// compatible with `poll_id` (global edges, or edges of the same poll).
pub(crate) fn upstream_origin(
    conn: &Connection,
    delegator_id: &str,
    poll_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<String>, EngineError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT d.chain_origin_id FROM delegations d \
                 WHERE {ACTIVE_CLAUSE} AND d.target_kind = 'user' AND d.target_id = ?2 \
                 AND (d.poll_id IS NULL OR d.poll_id = ?3) \
                 ORDER BY d.created_at ASC, d.id ASC LIMIT 1"
            ),
            params![to_unix(now), delegator_id, poll_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

pub(crate) fn mark_revoked(conn: &Connection, edge_id: &str, at: DateTime<Utc>) -> Result<bool, EngineError> {
    let changed = conn.execute(
        "UPDATE delegations SET revoked_at = ?2 WHERE id = ?1 AND revoked_at IS NULL AND is_deleted = 0",
        params![edge_id, to_unix(at)],
    )?;
    Ok(changed > 0)
}

pub(crate) fn mark_deleted(conn: &Connection, edge_id: &str) -> Result<bool, EngineError> {
    let changed = conn.execute(
        "UPDATE delegations SET is_deleted = 1 WHERE id = ?1 AND is_deleted = 0",
        params![edge_id],
    )?;
    Ok(changed > 0)
}

/// Returns false when the vote already existed.
pub(crate) fn insert_vote(
    conn: &Connection,
    user_id: &str,
    poll_id: &str,
    at: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO votes (user_id, poll_id, cast_at) VALUES (?1, ?2, ?3)",
        params![user_id, poll_id, to_unix(at)],
    )?;
    Ok(changed > 0)
}

pub(crate) fn upsert_target(conn: &Connection, target: &TargetRef, name: &str) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO targets (target_kind, target_id, name, is_active, is_deleted) \
         VALUES (?1, ?2, ?3, 1, 0) \
         ON CONFLICT(target_kind, target_id) DO UPDATE SET name = excluded.name, \
         is_active = 1, is_deleted = 0",
        params![target.kind().as_str(), target.id(), name],
    )?;
    Ok(())
}

pub(crate) fn update_target_active(
    conn: &Connection,
    target: &TargetRef,
    active: bool,
) -> Result<bool, EngineError> {
    let changed = conn.execute(
        "UPDATE targets SET is_active = ?3 WHERE target_kind = ?1 AND target_id = ?2",
        params![target.kind().as_str(), target.id(), active as i64],
    )?;
    Ok(changed > 0)
}

pub(crate) fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, EngineError> {
    Ok(conn
        .query_row(
            "SELECT value FROM engine_meta WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

pub(crate) fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO engine_meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Edges whose `end_date` falls in `(after, until]` and that were otherwise
/// still live, i.e. edges that expired in that window.
pub(crate) fn edges_expired_between(
    conn: &Connection,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<DelegationEdge>, EngineError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EDGE_COLUMNS} FROM delegations d \
         WHERE d.end_date IS NOT NULL AND d.is_deleted = 0 AND d.revoked_at IS NULL \
         AND d.end_date > ?1 AND d.end_date <= ?2 \
         ORDER BY d.end_date, d.id"
    ))?;
    let rows = stmt.query_map(params![to_unix(after), to_unix(until)], edge_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn expiry_watermark(conn: &Connection) -> Result<Option<DateTime<Utc>>, EngineError> {
    Ok(read_meta(conn, schemas::META_EXPIRY_WATERMARK)?
        .and_then(|v| v.parse::<i64>().ok())
        .map(from_unix))
}

pub(crate) fn set_expiry_watermark(conn: &Connection, at: DateTime<Utc>) -> Result<(), EngineError> {
    write_meta(conn, schemas::META_EXPIRY_WATERMARK, &to_unix(at).to_string())
}
