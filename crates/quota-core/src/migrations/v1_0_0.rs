//! Migration v1.0.0: base quota-governor schema.
//!
//! Creates the six tables that back every component:
//! - `tenants`: tier, billing lapse date, per-tenant overrides
//! - `limit_configs`: request/token ceilings per (provider, model, tier)
//! - `windows`: sliding-window accounting buckets per (tenant, provider, model, horizon)
//! - `queue_entries`: the priority FIFO queue
//! - `events`: the admission-decision audit trail
//! - `patterns`: learned usage patterns

use super::Migration;

/// Version number: 1_000_000 represents v1.0.0
pub const VERSION: i64 = 1_000_000;

const ADD_COLUMNS: &[(&str, &str, &str)] = &[];

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v1.0.0: base quota-governor schema",
        sql: SQL,
        add_columns: ADD_COLUMNS,
    }
}

const SQL: &str = r#"
-- ============================================================================
-- QuotaGuard v1.0.0 Schema
-- ============================================================================

-- ----------------------------------------------------------------------------
-- 1. TENANTS
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS tenants (
    tenant_id TEXT PRIMARY KEY,
    tier TEXT NOT NULL DEFAULT 'free' CHECK (tier IN ('free', 'pro')),
    paid_until TEXT,
    base_rpm INTEGER NOT NULL DEFAULT 100,
    max_queue_size_override INTEGER
);

-- ----------------------------------------------------------------------------
-- 2. LIMIT CONFIGS
-- model = NULL is the provider-wide fallback row for a tier.
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS limit_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    model TEXT,
    tier TEXT NOT NULL CHECK (tier IN ('free', 'pro')),
    requests_per_minute INTEGER,
    requests_per_hour INTEGER,
    requests_per_day INTEGER,
    tokens_per_minute INTEGER,
    tokens_per_day INTEGER,
    UNIQUE(provider, model, tier)
);

CREATE INDEX IF NOT EXISTS idx_limit_configs_lookup ON limit_configs(provider, tier);

-- ----------------------------------------------------------------------------
-- 3. WINDOWS
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS windows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    horizon TEXT NOT NULL CHECK (horizon IN ('minute', 'hour', 'day')),
    start TEXT NOT NULL,
    end TEXT NOT NULL,
    request_count INTEGER NOT NULL DEFAULT 0,
    token_count INTEGER NOT NULL DEFAULT 0,
    request_limit INTEGER,
    token_limit INTEGER,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_windows_lookup
    ON windows(tenant_id, provider, model, horizon, active);
CREATE INDEX IF NOT EXISTS idx_windows_end ON windows(end);

-- ----------------------------------------------------------------------------
-- 4. QUEUE ENTRIES
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS queue_entries (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 5,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    queued_at TEXT NOT NULL,
    processed_at TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_entries_dequeue
    ON queue_entries(tenant_id, status, priority DESC, queued_at ASC);
CREATE INDEX IF NOT EXISTS idx_queue_entries_status ON queue_entries(status);

-- ----------------------------------------------------------------------------
-- 5. EVENTS
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('allowed', 'warned', 'blocked', 'queued')),
    horizon TEXT CHECK (horizon IS NULL OR horizon IN ('minute', 'hour', 'day')),
    current_count INTEGER,
    limit_value INTEGER,
    percent_used REAL,
    request_id TEXT NOT NULL,
    was_queued INTEGER NOT NULL DEFAULT 0,
    queue_time_ms INTEGER,
    detected_pattern_tag TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_tenant_time ON events(tenant_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);

-- ----------------------------------------------------------------------------
-- 6. PATTERNS
-- ----------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS patterns (
    pattern_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('time-of-day', 'day-of-week', 'burst')),
    label TEXT NOT NULL,
    average_rpm REAL NOT NULL,
    peak_rpm INTEGER NOT NULL,
    confidence REAL NOT NULL,
    suggested_limit INTEGER,
    suggested_queue_size INTEGER,
    observation_count INTEGER NOT NULL DEFAULT 0,
    first_detected TEXT NOT NULL,
    last_observed TEXT NOT NULL,
    description TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_patterns_tenant ON patterns(tenant_id, kind);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::{init_sqlite_schema, run_migrations};
    use rusqlite::Connection;

    #[test]
    fn test_migration_version() {
        assert_eq!(VERSION, 1_000_000);
    }

    #[test]
    fn test_tenants_table_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        init_sqlite_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO tenants (tenant_id, tier) VALUES ('t1', 'pro')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO tenants (tenant_id, tier) VALUES ('t2', 'enterprise')",
            [],
        );
        assert!(result.is_err(), "unknown tier should be rejected");
    }

    #[test]
    fn test_queue_entries_unique_id() {
        let conn = Connection::open_in_memory().unwrap();
        init_sqlite_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO queue_entries (id, tenant_id, provider, model, payload, queued_at) \
             VALUES ('q1', 't1', 'anthropic', 'claude', '{}', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO queue_entries (id, tenant_id, provider, model, payload, queued_at) \
             VALUES ('q1', 't1', 'anthropic', 'claude', '{}', '2026-01-01T00:00:01Z')",
            [],
        );
        assert!(result.is_err(), "duplicate queue id should be rejected");
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_sqlite_schema(&conn).unwrap();
        let applied = run_migrations(&conn).unwrap();
        assert_eq!(applied, 0, "second run should apply no migrations");
    }
}
