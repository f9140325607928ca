//! QuotaGuard Storage
//!
//! The durable Store: the sole custodian of tenants, limit configs,
//! windows, queue entries, events and patterns. Every other component
//! reaches durable state exclusively through the `QuotaStore` trait here.
//! Contains no policy — callers decide what an "exceeded" or "admit"
//! means; this crate only persists and retrieves.

use chrono::{DateTime, Utc};
use quotaguard_core::{
    migrations::init_sqlite_schema, CoreError, Event, EventKind, Horizon, LimitConfig, Pattern,
    PatternKind, QueueEntry, QueueStatus, Result, Tenant, Tier, Window,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

/// Durable state operations needed by the engine crate.
///
/// Every operation here is individually atomic: a call that touches more
/// than one statement wraps them in a single SQLite transaction. Composite
/// operations that must be atomic *across* calls (admit + pre-increment,
/// dequeue + re-pend) are the caller's responsibility, coordinated via a
/// per-tenant mutex.
pub trait QuotaStore: Send + Sync {
    fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>>;
    fn upsert_tenant(&self, tenant: &Tenant) -> Result<()>;

    /// Most specific matching row: exact model match beats a `model=null`
    /// provider fallback. `None` if neither is configured.
    fn get_limit_config(&self, provider: &str, model: &str, tier: Tier) -> Result<Option<LimitConfig>>;
    fn upsert_limit_config(&self, cfg: &LimitConfig) -> Result<()>;

    fn get_current_window(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        horizon: Horizon,
    ) -> Result<Option<Window>>;
    /// Inserts `w` and returns it with its assigned id.
    fn create_window(&self, w: &Window) -> Result<Window>;
    fn deactivate_window(&self, id: i64) -> Result<()>;
    /// request-count += 1, token-count += delta_tokens.
    fn increment_window(&self, id: i64, delta_tokens: i64) -> Result<()>;
    /// token-count += delta_tokens only.
    fn add_tokens(&self, id: i64, delta_tokens: i64) -> Result<()>;
    fn get_active_windows(&self, tenant_id: &str) -> Result<Vec<Window>>;

    fn enqueue(&self, entry: &QueueEntry) -> Result<()>;
    /// Selects the highest-priority pending entry (priority desc, then
    /// queued-at asc) for `tenant_id`, marks it `processing`, returns it.
    fn dequeue_one(&self, tenant_id: &str) -> Result<Option<QueueEntry>>;
    fn complete_queued(&self, id: &str, success: bool, error: Option<&str>) -> Result<()>;
    /// Moves a dequeued-but-not-admissible entry back to pending without
    /// touching retry_count (no failure occurred).
    fn repend(&self, id: &str) -> Result<()>;
    fn cancel_queue_entry(&self, id: &str) -> Result<()>;
    fn update_queue_priority(&self, id: &str, priority: i32) -> Result<()>;
    /// Count of pending entries strictly ahead of `id` under the ordering rule.
    fn queue_position(&self, id: &str) -> Result<Option<usize>>;
    fn pending_count(&self, tenant_id: &str) -> Result<i64>;
    fn queue_entries(&self, tenant_id: &str, limit: usize) -> Result<Vec<QueueEntry>>;
    fn get_queue_entry(&self, id: &str) -> Result<Option<QueueEntry>>;

    fn record_event(&self, e: &Event) -> Result<i64>;
    fn get_events(
        &self,
        tenant_id: &str,
        kind_filter: Option<EventKind>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Event>>;

    fn upsert_pattern(&self, p: &Pattern) -> Result<()>;
    fn get_patterns(&self, tenant_id: &str, limit: usize) -> Result<Vec<Pattern>>;

    /// Housekeeping: delete terminal-status data older than the given thresholds.
    fn prune_events(&self, older_than: DateTime<Utc>) -> Result<usize>;
    fn prune_terminal_queue_entries(&self, older_than: DateTime<Utc>) -> Result<usize>;
    fn prune_deactivated_windows(&self, older_than: DateTime<Utc>) -> Result<usize>;
    fn prune_low_confidence_patterns(&self, confidence_below: f64, older_than: DateTime<Utc>) -> Result<usize>;
}

/// SQLite-backed `QuotaStore`.
///
/// Opens a fresh connection per call (no pooling): the workload is
/// low-concurrency, per-host, and this keeps the implementation free of
/// pool-exhaustion failure modes. WAL journaling lets readers and a
/// writer proceed concurrently across connections.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a connection, enabling the pragmas every operation depends on,
    /// and make sure the schema is present.
    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        init_sqlite_schema(&conn)?;
        Ok(conn)
    }

    /// Create the database file and schema. Errors if it already exists.
    pub fn initialize(&self) -> Result<()> {
        if self.path.exists() {
            return Err(CoreError::InvalidInput(format!(
                "store already exists at {:?}",
                self.path
            )));
        }
        tracing::info!(path = ?self.path, "initializing quota store");
        self.connect()?;
        Ok(())
    }
}

fn row_to_tenant(row: &Row) -> rusqlite::Result<Tenant> {
    let tier_str: String = row.get("tier")?;
    let paid_until: Option<String> = row.get("paid_until")?;
    Ok(Tenant {
        tenant_id: row.get("tenant_id")?,
        tier: Tier::parse(&tier_str).unwrap_or(Tier::Free),
        paid_until: paid_until.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))),
        base_rpm: row.get("base_rpm")?,
        max_queue_size_override: row.get("max_queue_size_override")?,
    })
}

fn row_to_limit_config(row: &Row) -> rusqlite::Result<LimitConfig> {
    let tier_str: String = row.get("tier")?;
    Ok(LimitConfig {
        provider: row.get("provider")?,
        model: row.get("model")?,
        tier: Tier::parse(&tier_str).unwrap_or(Tier::Free),
        requests_per_minute: row.get("requests_per_minute")?,
        requests_per_hour: row.get("requests_per_hour")?,
        requests_per_day: row.get("requests_per_day")?,
        tokens_per_minute: row.get("tokens_per_minute")?,
        tokens_per_day: row.get("tokens_per_day")?,
    })
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_window(row: &Row) -> rusqlite::Result<Window> {
    let horizon_str: String = row.get("horizon")?;
    let start: String = row.get("start")?;
    let end: String = row.get("end")?;
    Ok(Window {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        provider: row.get("provider")?,
        model: row.get("model")?,
        horizon: Horizon::parse(&horizon_str).unwrap_or(Horizon::Minute),
        start: parse_dt(&start),
        end: parse_dt(&end),
        request_count: row.get("request_count")?,
        token_count: row.get("token_count")?,
        request_limit: row.get("request_limit")?,
        token_limit: row.get("token_limit")?,
        active: row.get::<_, i64>("active")? != 0,
    })
}

fn row_to_queue_entry(row: &Row) -> rusqlite::Result<QueueEntry> {
    let status_str: String = row.get("status")?;
    let queued_at: String = row.get("queued_at")?;
    let processed_at: Option<String> = row.get("processed_at")?;
    Ok(QueueEntry {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        provider: row.get("provider")?,
        model: row.get("model")?,
        payload: row.get("payload")?,
        priority: row.get("priority")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        status: QueueStatus::parse(&status_str).unwrap_or(QueueStatus::Pending),
        queued_at: parse_dt(&queued_at),
        processed_at: processed_at.map(|s| parse_dt(&s)),
        error: row.get("error")?,
    })
}

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let kind_str: String = row.get("kind")?;
    let horizon_str: Option<String> = row.get("horizon")?;
    let timestamp: String = row.get("timestamp")?;
    Ok(Event {
        id: row.get("id")?,
        tenant_id: row.get("tenant_id")?,
        provider: row.get("provider")?,
        model: row.get("model")?,
        timestamp: parse_dt(&timestamp),
        kind: EventKind::parse(&kind_str).unwrap_or(EventKind::Allowed),
        horizon: horizon_str.and_then(|s| Horizon::parse(&s)),
        current_count: row.get("current_count")?,
        limit: row.get("limit_value")?,
        percent_used: row.get("percent_used")?,
        request_id: row.get("request_id")?,
        was_queued: row.get::<_, i64>("was_queued")? != 0,
        queue_time_ms: row.get("queue_time_ms")?,
        detected_pattern_tag: row.get("detected_pattern_tag")?,
    })
}

fn row_to_pattern(row: &Row) -> rusqlite::Result<Pattern> {
    let kind_str: String = row.get("kind")?;
    let first_detected: String = row.get("first_detected")?;
    let last_observed: String = row.get("last_observed")?;
    Ok(Pattern {
        pattern_id: row.get("pattern_id")?,
        tenant_id: row.get("tenant_id")?,
        kind: PatternKind::parse(&kind_str).unwrap_or(PatternKind::Burst),
        label: row.get("label")?,
        average_rpm: row.get("average_rpm")?,
        peak_rpm: row.get("peak_rpm")?,
        confidence: row.get("confidence")?,
        suggested_limit: row.get("suggested_limit")?,
        suggested_queue_size: row.get("suggested_queue_size")?,
        observation_count: row.get("observation_count")?,
        first_detected: parse_dt(&first_detected),
        last_observed: parse_dt(&last_observed),
        description: row.get("description")?,
    })
}

impl QuotaStore for SqliteStore {
    fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let conn = self.connect()?;
        let tenant = conn
            .query_row(
                "SELECT * FROM tenants WHERE tenant_id = ?1",
                params![tenant_id],
                row_to_tenant,
            )
            .optional()?;
        Ok(tenant)
    }

    fn upsert_tenant(&self, tenant: &Tenant) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO tenants (tenant_id, tier, paid_until, base_rpm, max_queue_size_override)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant_id) DO UPDATE SET
               tier = excluded.tier,
               paid_until = excluded.paid_until,
               base_rpm = excluded.base_rpm,
               max_queue_size_override = excluded.max_queue_size_override",
            params![
                tenant.tenant_id,
                tenant.tier.as_str(),
                tenant.paid_until.map(|d| d.to_rfc3339()),
                tenant.base_rpm,
                tenant.max_queue_size_override,
            ],
        )?;
        Ok(())
    }

    fn get_limit_config(&self, provider: &str, model: &str, tier: Tier) -> Result<Option<LimitConfig>> {
        let conn = self.connect()?;
        let exact = conn
            .query_row(
                "SELECT * FROM limit_configs WHERE provider = ?1 AND model = ?2 AND tier = ?3",
                params![provider, model, tier.as_str()],
                row_to_limit_config,
            )
            .optional()?;
        if exact.is_some() {
            return Ok(exact);
        }
        let fallback = conn
            .query_row(
                "SELECT * FROM limit_configs WHERE provider = ?1 AND model IS NULL AND tier = ?2",
                params![provider, tier.as_str()],
                row_to_limit_config,
            )
            .optional()?;
        Ok(fallback)
    }

    fn upsert_limit_config(&self, cfg: &LimitConfig) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO limit_configs
               (provider, model, tier, requests_per_minute, requests_per_hour, requests_per_day, tokens_per_minute, tokens_per_day)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(provider, model, tier) DO UPDATE SET
               requests_per_minute = excluded.requests_per_minute,
               requests_per_hour = excluded.requests_per_hour,
               requests_per_day = excluded.requests_per_day,
               tokens_per_minute = excluded.tokens_per_minute,
               tokens_per_day = excluded.tokens_per_day",
            params![
                cfg.provider,
                cfg.model,
                cfg.tier.as_str(),
                cfg.requests_per_minute,
                cfg.requests_per_hour,
                cfg.requests_per_day,
                cfg.tokens_per_minute,
                cfg.tokens_per_day,
            ],
        )?;
        Ok(())
    }

    fn get_current_window(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        horizon: Horizon,
    ) -> Result<Option<Window>> {
        let conn = self.connect()?;
        let window = conn
            .query_row(
                "SELECT * FROM windows
                 WHERE tenant_id = ?1 AND provider = ?2 AND model = ?3 AND horizon = ?4 AND active = 1",
                params![tenant_id, provider, model, horizon.as_str()],
                row_to_window,
            )
            .optional()?;
        Ok(window)
    }

    fn create_window(&self, w: &Window) -> Result<Window> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO windows
               (tenant_id, provider, model, horizon, start, end, request_count, token_count, request_limit, token_limit, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)",
            params![
                w.tenant_id,
                w.provider,
                w.model,
                w.horizon.as_str(),
                w.start.to_rfc3339(),
                w.end.to_rfc3339(),
                w.request_count,
                w.token_count,
                w.request_limit,
                w.token_limit,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let mut created = w.clone();
        created.id = id;
        created.active = true;
        Ok(created)
    }

    fn deactivate_window(&self, id: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute("UPDATE windows SET active = 0 WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn increment_window(&self, id: i64, delta_tokens: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE windows SET request_count = request_count + 1, token_count = token_count + ?2 WHERE id = ?1",
            params![id, delta_tokens],
        )?;
        Ok(())
    }

    fn add_tokens(&self, id: i64, delta_tokens: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE windows SET token_count = token_count + ?2 WHERE id = ?1",
            params![id, delta_tokens],
        )?;
        Ok(())
    }

    fn get_active_windows(&self, tenant_id: &str) -> Result<Vec<Window>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM windows WHERE tenant_id = ?1 AND active = 1 ORDER BY provider, horizon",
        )?;
        let rows = stmt
            .query_map(params![tenant_id], row_to_window)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn enqueue(&self, entry: &QueueEntry) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO queue_entries
               (id, tenant_id, provider, model, payload, priority, retry_count, max_retries, status, queued_at, processed_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.id,
                entry.tenant_id,
                entry.provider,
                entry.model,
                entry.payload,
                entry.priority,
                entry.retry_count,
                entry.max_retries,
                entry.status.as_str(),
                entry.queued_at.to_rfc3339(),
                entry.processed_at.map(|d| d.to_rfc3339()),
                entry.error,
            ],
        )?;
        Ok(())
    }

    fn dequeue_one(&self, tenant_id: &str) -> Result<Option<QueueEntry>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let entry = tx
            .query_row(
                "SELECT * FROM queue_entries
                 WHERE tenant_id = ?1 AND status = 'pending'
                 ORDER BY priority DESC, queued_at ASC
                 LIMIT 1",
                params![tenant_id],
                row_to_queue_entry,
            )
            .optional()?;
        if let Some(entry) = &entry {
            tx.execute(
                "UPDATE queue_entries SET status = 'processing' WHERE id = ?1",
                params![entry.id],
            )?;
        }
        tx.commit()?;
        Ok(entry.map(|mut e| {
            e.status = QueueStatus::Processing;
            e
        }))
    }

    fn complete_queued(&self, id: &str, success: bool, error: Option<&str>) -> Result<()> {
        let conn = self.connect()?;
        if success {
            conn.execute(
                "UPDATE queue_entries SET status = 'completed', processed_at = ?2, error = NULL WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )?;
        } else {
            conn.execute(
                "UPDATE queue_entries
                 SET status = 'failed', processed_at = ?2, error = ?3, retry_count = retry_count + 1
                 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339(), error],
            )?;
        }
        Ok(())
    }

    fn repend(&self, id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE queue_entries SET status = 'pending' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn cancel_queue_entry(&self, id: &str) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE queue_entries SET status = 'failed', error = 'cancelled', processed_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!(
                "no pending queue entry {id}"
            )));
        }
        Ok(())
    }

    fn update_queue_priority(&self, id: &str, priority: i32) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE queue_entries SET priority = ?2 WHERE id = ?1 AND status = 'pending'",
            params![id, priority],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!(
                "no pending queue entry {id}"
            )));
        }
        Ok(())
    }

    fn queue_position(&self, id: &str) -> Result<Option<usize>> {
        let conn = self.connect()?;
        let target = conn
            .query_row(
                "SELECT priority, queued_at FROM queue_entries WHERE id = ?1 AND status = 'pending'",
                params![id],
                |row| Ok((row.get::<_, i32>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((priority, queued_at)) = target else {
            return Ok(None);
        };
        let ahead: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_entries
             WHERE status = 'pending'
               AND (priority > ?1 OR (priority = ?1 AND queued_at < ?2))",
            params![priority, queued_at],
            |row| row.get(0),
        )?;
        Ok(Some(ahead as usize))
    }

    fn pending_count(&self, tenant_id: &str) -> Result<i64> {
        let conn = self.connect()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM queue_entries WHERE tenant_id = ?1 AND status = 'pending'",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn queue_entries(&self, tenant_id: &str, limit: usize) -> Result<Vec<QueueEntry>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM queue_entries WHERE tenant_id = ?1
             ORDER BY priority DESC, queued_at ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![tenant_id, limit as i64], row_to_queue_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_queue_entry(&self, id: &str) -> Result<Option<QueueEntry>> {
        let conn = self.connect()?;
        let entry = conn
            .query_row(
                "SELECT * FROM queue_entries WHERE id = ?1",
                params![id],
                row_to_queue_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn record_event(&self, e: &Event) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO events
               (tenant_id, provider, model, timestamp, kind, horizon, current_count, limit_value,
                percent_used, request_id, was_queued, queue_time_ms, detected_pattern_tag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                e.tenant_id,
                e.provider,
                e.model,
                e.timestamp.to_rfc3339(),
                e.kind.as_str(),
                e.horizon.map(|h| h.as_str()),
                e.current_count,
                e.limit,
                e.percent_used,
                e.request_id,
                e.was_queued as i64,
                e.queue_time_ms,
                e.detected_pattern_tag,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_events(
        &self,
        tenant_id: &str,
        kind_filter: Option<EventKind>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let conn = self.connect()?;
        let rows = match kind_filter {
            Some(kind) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM events WHERE tenant_id = ?1 AND kind = ?2 AND timestamp >= ?3
                     ORDER BY timestamp DESC",
                )?;
                let result = stmt
                    .query_map(params![tenant_id, kind.as_str(), since.to_rfc3339()], row_to_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM events WHERE tenant_id = ?1 AND timestamp >= ?2
                     ORDER BY timestamp DESC",
                )?;
                let result = stmt
                    .query_map(params![tenant_id, since.to_rfc3339()], row_to_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
        };
        Ok(rows)
    }

    fn upsert_pattern(&self, p: &Pattern) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO patterns
               (pattern_id, tenant_id, kind, label, average_rpm, peak_rpm, confidence,
                suggested_limit, suggested_queue_size, observation_count, first_detected, last_observed, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(pattern_id) DO UPDATE SET
               label = excluded.label,
               average_rpm = excluded.average_rpm,
               peak_rpm = excluded.peak_rpm,
               confidence = excluded.confidence,
               suggested_limit = excluded.suggested_limit,
               suggested_queue_size = excluded.suggested_queue_size,
               observation_count = excluded.observation_count,
               last_observed = excluded.last_observed,
               description = excluded.description",
            params![
                p.pattern_id,
                p.tenant_id,
                p.kind.as_str(),
                p.label,
                p.average_rpm,
                p.peak_rpm,
                p.confidence,
                p.suggested_limit,
                p.suggested_queue_size,
                p.observation_count,
                p.first_detected.to_rfc3339(),
                p.last_observed.to_rfc3339(),
                p.description,
            ],
        )?;
        Ok(())
    }

    fn get_patterns(&self, tenant_id: &str, limit: usize) -> Result<Vec<Pattern>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM patterns WHERE tenant_id = ?1 ORDER BY confidence DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![tenant_id, limit as i64], row_to_pattern)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn prune_events(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        let n = conn.execute(
            "DELETE FROM events WHERE timestamp < ?1",
            params![older_than.to_rfc3339()],
        )?;
        Ok(n)
    }

    fn prune_terminal_queue_entries(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        let n = conn.execute(
            "DELETE FROM queue_entries
             WHERE status IN ('completed', 'failed') AND processed_at < ?1",
            params![older_than.to_rfc3339()],
        )?;
        Ok(n)
    }

    fn prune_deactivated_windows(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        let n = conn.execute(
            "DELETE FROM windows WHERE active = 0 AND end < ?1",
            params![older_than.to_rfc3339()],
        )?;
        Ok(n)
    }

    fn prune_low_confidence_patterns(&self, confidence_below: f64, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        let n = conn.execute(
            "DELETE FROM patterns WHERE confidence < ?1 AND last_observed < ?2",
            params![confidence_below, older_than.to_rfc3339()],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotaguard_core::{DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_PRIORITY};
    use tempfile::NamedTempFile;

    fn store() -> SqliteStore {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        SqliteStore::new(path)
    }

    #[test]
    fn initialize_creates_all_tables() {
        let store = store();
        store.initialize().unwrap();
        let conn = store.connect().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='tenants'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn tenant_upsert_and_get_round_trips() {
        let store = store();
        let mut tenant = Tenant::new("t1");
        tenant.tier = Tier::Pro;
        tenant.paid_until = Some(Utc::now() + chrono::Duration::days(30));
        store.upsert_tenant(&tenant).unwrap();

        let fetched = store.get_tenant("t1").unwrap().unwrap();
        assert_eq!(fetched.tenant_id, "t1");
        assert_eq!(fetched.tier, Tier::Pro);
        assert!(fetched.paid_until.is_some());

        assert!(store.get_tenant("nonexistent").unwrap().is_none());
    }

    #[test]
    fn limit_config_prefers_exact_model_over_fallback() {
        let store = store();
        store
            .upsert_limit_config(&LimitConfig {
                provider: "anthropic".into(),
                model: None,
                tier: Tier::Free,
                requests_per_minute: Some(50),
                requests_per_hour: None,
                requests_per_day: Some(1000),
                tokens_per_minute: None,
                tokens_per_day: None,
            })
            .unwrap();
        store
            .upsert_limit_config(&LimitConfig {
                provider: "anthropic".into(),
                model: Some("claude-3-5-sonnet".into()),
                tier: Tier::Free,
                requests_per_minute: Some(10),
                requests_per_hour: None,
                requests_per_day: None,
                tokens_per_minute: None,
                tokens_per_day: None,
            })
            .unwrap();

        let exact = store
            .get_limit_config("anthropic", "claude-3-5-sonnet", Tier::Free)
            .unwrap()
            .unwrap();
        assert_eq!(exact.requests_per_minute, Some(10));

        let fallback = store
            .get_limit_config("anthropic", "claude-2", Tier::Free)
            .unwrap()
            .unwrap();
        assert_eq!(fallback.requests_per_minute, Some(50));

        assert!(store
            .get_limit_config("openai", "gpt-4o", Tier::Free)
            .unwrap()
            .is_none());
    }

    #[test]
    fn window_create_increment_and_rotate() {
        let store = store();
        let now = Utc::now();
        let w = Window {
            id: 0,
            tenant_id: "t1".into(),
            provider: "anthropic".into(),
            model: "claude".into(),
            horizon: Horizon::Minute,
            start: now,
            end: now + Horizon::Minute.duration(),
            request_count: 0,
            token_count: 0,
            request_limit: Some(50),
            token_limit: None,
            active: true,
        };
        let created = store.create_window(&w).unwrap();
        assert!(created.id > 0);

        store.increment_window(created.id, 120).unwrap();
        let fetched = store
            .get_current_window("t1", "anthropic", "claude", Horizon::Minute)
            .unwrap()
            .unwrap();
        assert_eq!(fetched.request_count, 1);
        assert_eq!(fetched.token_count, 120);

        store.deactivate_window(created.id).unwrap();
        assert!(store
            .get_current_window("t1", "anthropic", "claude", Horizon::Minute)
            .unwrap()
            .is_none());
    }

    fn queue_entry(id: &str, priority: i32, queued_at: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            id: id.into(),
            tenant_id: "t1".into(),
            provider: "anthropic".into(),
            model: "claude".into(),
            payload: "{}".into(),
            priority,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            status: QueueStatus::Pending,
            queued_at,
            processed_at: None,
            error: None,
        }
    }

    #[test]
    fn dequeue_respects_priority_then_fifo() {
        let store = store();
        let t0 = Utc::now();
        store.enqueue(&queue_entry("q1", 3, t0)).unwrap();
        store
            .enqueue(&queue_entry("q2", 8, t0 + chrono::Duration::milliseconds(1)))
            .unwrap();
        store
            .enqueue(&queue_entry("q3", 8, t0 + chrono::Duration::milliseconds(2)))
            .unwrap();

        let first = store.dequeue_one("t1").unwrap().unwrap();
        assert_eq!(first.id, "q2");
        store.complete_queued("q2", true, None).unwrap();

        let second = store.dequeue_one("t1").unwrap().unwrap();
        assert_eq!(second.id, "q3");
        store.complete_queued("q3", true, None).unwrap();

        let third = store.dequeue_one("t1").unwrap().unwrap();
        assert_eq!(third.id, "q1");
    }

    #[test]
    fn repend_does_not_increment_retry_count() {
        let store = store();
        store
            .enqueue(&queue_entry("q1", DEFAULT_QUEUE_PRIORITY, Utc::now()))
            .unwrap();
        let dequeued = store.dequeue_one("t1").unwrap().unwrap();
        assert_eq!(dequeued.retry_count, 0);

        store.repend("q1").unwrap();
        let entry = store.get_queue_entry("q1").unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.retry_count, 0);
    }

    #[test]
    fn cancel_only_affects_pending_entries() {
        let store = store();
        store
            .enqueue(&queue_entry("q1", DEFAULT_QUEUE_PRIORITY, Utc::now()))
            .unwrap();
        store.cancel_queue_entry("q1").unwrap();
        let entry = store.get_queue_entry("q1").unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("cancelled"));

        assert!(store.cancel_queue_entry("q1").is_err());
    }

    #[test]
    fn queue_position_counts_entries_ahead() {
        let store = store();
        let t0 = Utc::now();
        store.enqueue(&queue_entry("q1", 5, t0)).unwrap();
        store
            .enqueue(&queue_entry("q2", 5, t0 + chrono::Duration::milliseconds(1)))
            .unwrap();
        store
            .enqueue(&queue_entry("q3", 9, t0 + chrono::Duration::milliseconds(2)))
            .unwrap();

        assert_eq!(store.queue_position("q3").unwrap(), Some(0));
        assert_eq!(store.queue_position("q1").unwrap(), Some(1));
        assert_eq!(store.queue_position("q2").unwrap(), Some(2));
    }

    #[test]
    fn prune_events_removes_only_stale_rows() {
        let store = store();
        let old = Event {
            id: 0,
            tenant_id: "t1".into(),
            provider: "anthropic".into(),
            model: "claude".into(),
            timestamp: Utc::now() - chrono::Duration::days(40),
            kind: EventKind::Allowed,
            horizon: Some(Horizon::Minute),
            current_count: Some(1),
            limit: Some(50),
            percent_used: Some(2.0),
            request_id: "r1".into(),
            was_queued: false,
            queue_time_ms: None,
            detected_pattern_tag: None,
        };
        let mut recent = old.clone();
        recent.timestamp = Utc::now();
        recent.request_id = "r2".into();
        store.record_event(&old).unwrap();
        store.record_event(&recent).unwrap();

        let pruned = store
            .prune_events(Utc::now() - chrono::Duration::days(30))
            .unwrap();
        assert_eq!(pruned, 1);

        let remaining = store
            .get_events("t1", None, Utc::now() - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].request_id, "r2");
    }
}
