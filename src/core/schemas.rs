//! Centralized database schema definitions for the delegation store.
//!
//! Everything lives in one SQLite database (`delegation.db`):
//! 1. `delegations`: delegation edges (global when `poll_id` is NULL).
//! 2. `votes`: direct votes, unique per (user, poll).
//! 3. `targets`: the unified-targets view over users, values, ideas,
//!    institutions and fields.
//! 4. `engine_meta`: small key/value state (expiry sweep watermark).
//!
//! Timestamps are unix seconds so activity filters compare numerically.

pub const DELEGATION_DB_NAME: &str = "delegation.db";
pub const BROKER_EVENTS_NAME: &str = "broker.events.jsonl";
pub const GOVERNANCE_EVENTS_NAME: &str = "governance.events.jsonl";
pub const CONFIG_FILE_NAME: &str = "delegation.toml";

pub const DELEGATION_DB_SCHEMA_EDGES: &str = "
    CREATE TABLE IF NOT EXISTS delegations (
        id TEXT PRIMARY KEY,
        delegator_id TEXT NOT NULL,
        target_kind TEXT NOT NULL, -- user | value | idea | institution | field
        target_id TEXT NOT NULL,
        poll_id TEXT, -- NULL = global
        mode TEXT NOT NULL, -- legacy_fixed_term | flexible_domain | hybrid_seed
        is_anonymous INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        start_date INTEGER NOT NULL,
        end_date INTEGER,
        revoked_at INTEGER,
        chain_origin_id TEXT NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0
    )
";

// The legacy term cap is enforced by the write path, not by a CHECK constraint.
pub const DELEGATION_DB_INDEX_ACTIVE: &str = "
    CREATE INDEX IF NOT EXISTS idx_delegations_active
    ON delegations(delegator_id, is_deleted, revoked_at, poll_id, mode, created_at)
    WHERE is_deleted = 0 AND revoked_at IS NULL
";
pub const DELEGATION_DB_INDEX_DELEGATEE: &str = "
    CREATE INDEX IF NOT EXISTS idx_delegations_delegatee
    ON delegations(target_kind, target_id)
";
pub const DELEGATION_DB_INDEX_ORIGIN: &str =
    "CREATE INDEX IF NOT EXISTS idx_delegations_origin ON delegations(chain_origin_id)";
pub const DELEGATION_DB_INDEX_END_DATE: &str = "
    CREATE INDEX IF NOT EXISTS idx_delegations_end_date
    ON delegations(end_date)
    WHERE end_date IS NOT NULL AND is_deleted = 0 AND revoked_at IS NULL
";

pub const DELEGATION_DB_SCHEMA_VOTES: &str = "
    CREATE TABLE IF NOT EXISTS votes (
        user_id TEXT NOT NULL,
        poll_id TEXT NOT NULL,
        cast_at INTEGER NOT NULL,
        PRIMARY KEY (user_id, poll_id)
    )
";
pub const DELEGATION_DB_INDEX_VOTES_POLL: &str =
    "CREATE INDEX IF NOT EXISTS idx_votes_poll ON votes(poll_id, user_id)";

pub const DELEGATION_DB_SCHEMA_TARGETS: &str = "
    CREATE TABLE IF NOT EXISTS targets (
        target_kind TEXT NOT NULL,
        target_id TEXT NOT NULL,
        name TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (target_kind, target_id)
    )
";

pub const DELEGATION_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS engine_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const META_EXPIRY_WATERMARK: &str = "expiry_watermark";

/// Statements run (in order) when the delegation store is initialized.
pub const DELEGATION_DB_STATEMENTS: &[&str] = &[
    DELEGATION_DB_SCHEMA_EDGES,
    DELEGATION_DB_INDEX_ACTIVE,
    DELEGATION_DB_INDEX_DELEGATEE,
    DELEGATION_DB_INDEX_ORIGIN,
    DELEGATION_DB_INDEX_END_DATE,
    DELEGATION_DB_SCHEMA_VOTES,
    DELEGATION_DB_INDEX_VOTES_POLL,
    DELEGATION_DB_SCHEMA_TARGETS,
    DELEGATION_DB_SCHEMA_META,
];
