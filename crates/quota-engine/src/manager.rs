//! Orchestrator composing the Store, WindowTracker, Queue and
//! PatternDetector behind the three pipeline hooks a host calls into:
//! pre-call, post-call, session-end.
//!
//! Per-tenant serialization is provided by a `DashMap` of per-tenant
//! `tokio::sync::Mutex` guards — the same concurrent-keyed-map primitive
//! this codebase already uses for its own per-key state. Operations for
//! different tenants proceed fully in parallel; within one tenant the
//! three composite critical sections (pre-call admission, post-call
//! accounting, queue drain) run one at a time.

use crate::config::GovernorConfig;
use crate::pattern_detector::PatternDetector;
use crate::queue::Queue;
use crate::window_tracker::{pre_increment_all_horizons, would_exceed_any_horizon, WindowTracker};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quotaguard_core::{
    CoreError, Event, EventKind, Horizon, LimitExceededInfo, Result, Tenant, Tier,
    TierCapabilities,
};
use quotaguard_storage::QuotaStore;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// The record a successful pre-call hands back to the host, and that the
/// host is expected to pass on to `post_call` unchanged.
#[derive(Debug, Clone)]
pub struct AdmittedCall {
    pub request_id: String,
    pub tenant_id: String,
    pub provider: String,
    pub model: String,
    pub tier: Tier,
    pub admitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct SessionRoster {
    request_count: u64,
    started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub request_count: u64,
    pub duration_ms: i64,
    pub active_windows: Vec<quotaguard_core::Window>,
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub tenant_id: String,
    pub tier: Tier,
    pub capabilities: TierCapabilities,
    pub active_windows: Vec<quotaguard_core::Window>,
    pub queue_size: i64,
    pub paid_until: Option<DateTime<Utc>>,
}

pub struct Manager {
    store: Arc<dyn QuotaStore>,
    window_tracker: WindowTracker,
    queue: Queue,
    pattern_detector: PatternDetector,
    config: GovernorConfig,
    tenant_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    session_rosters: DashMap<String, SessionRoster>,
}

impl Manager {
    pub fn new(store: Arc<dyn QuotaStore>, config: GovernorConfig) -> Self {
        Self {
            window_tracker: WindowTracker::new(store.clone()),
            queue: Queue::new(store.clone(), config.queue_max_age_secs),
            pattern_detector: PatternDetector::new(store.clone()),
            store,
            config,
            tenant_locks: DashMap::new(),
            session_rosters: DashMap::new(),
        }
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<AsyncMutex<()>> {
        self.tenant_locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn load_tenant(&self, tenant_id: &str) -> Result<Tenant> {
        match self.store.get_tenant(tenant_id)? {
            Some(tenant) => Ok(tenant),
            None => {
                let tenant = Tenant::new(tenant_id);
                self.store.upsert_tenant(&tenant)?;
                Ok(tenant)
            }
        }
    }

    /// Admits, queues, or blocks a call. On success the caller must pass
    /// the returned `AdmittedCall` on to `post_call`. On refusal the
    /// error carries a structured payload (`CoreError::Queued` or
    /// `CoreError::LimitExceeded`) describing why.
    pub async fn pre_call(
        &self,
        request_id: &str,
        provider: &str,
        model: &str,
        tenant_id: &str,
        session_id: &str,
        priority: Option<i32>,
        payload: &str,
    ) -> Result<AdmittedCall> {
        quotaguard_core::validation::validate_provider(provider)?;
        quotaguard_core::validation::validate_priority(priority.unwrap_or(quotaguard_core::DEFAULT_QUEUE_PRIORITY))?;
        quotaguard_core::validation::validate_payload(payload)?;

        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        let tenant = self.load_tenant(tenant_id)?;
        let now = Utc::now();
        let tier = tenant.effective_tier(now);
        let caps = tenant.capabilities(now);

        if let Some((horizon, decision)) = would_exceed_any_horizon(&self.window_tracker, tenant_id, provider, model, tier)? {
            let limit_info = LimitExceededInfo {
                horizon,
                current: decision.current,
                limit: decision.limit.unwrap_or(0),
                percent_used: decision.percent_used,
            };

            if tier == Tier::Pro && caps.may_queue {
                let outcome = self.queue.enqueue(
                    &tenant,
                    caps,
                    provider,
                    model,
                    payload,
                    priority.unwrap_or(quotaguard_core::DEFAULT_QUEUE_PRIORITY),
                    &limit_info,
                )?;
                if let CoreError::Queued(ref info) = outcome {
                    self.record_event(tenant_id, provider, model, EventKind::Queued, Some(horizon), Some(info.current), Some(info.limit), Some(info.percent_used), request_id, true, None);
                    return Err(outcome);
                }
                self.record_event(tenant_id, provider, model, EventKind::Blocked, Some(horizon), Some(limit_info.current), Some(limit_info.limit), Some(limit_info.percent_used), request_id, false, None);
                return Err(outcome);
            }

            warn!(tenant_id, provider, model, horizon = horizon.as_str(), "call blocked");
            self.record_event(tenant_id, provider, model, EventKind::Blocked, Some(horizon), Some(limit_info.current), Some(limit_info.limit), Some(limit_info.percent_used), request_id, false, None);
            return Err(CoreError::LimitExceeded(limit_info));
        }

        pre_increment_all_horizons(&self.window_tracker, tenant_id, provider, model, tier)?;
        self.record_event(tenant_id, provider, model, EventKind::Allowed, None, None, None, None, request_id, false, None);

        self.session_rosters
            .entry(session_id.to_string())
            .and_modify(|r| r.request_count += 1)
            .or_insert(SessionRoster { request_count: 1, started_at: Some(now) });

        debug!(tenant_id, provider, model, request_id, "call admitted");
        Ok(AdmittedCall {
            request_id: request_id.to_string(),
            tenant_id: tenant_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            tier,
            admitted_at: now,
        })
    }

    /// Records true token usage and opportunistically drains the queue.
    /// Never surfaces an error to the host — storage failures are logged
    /// and swallowed.
    pub async fn post_call(&self, admitted: Option<&AdmittedCall>, response: &serde_json::Value) {
        let Some(admitted) = admitted else {
            return;
        };

        let lock = self.tenant_lock(&admitted.tenant_id);
        let _guard = lock.lock().await;

        let tokens = extract_tokens_used(response);
        if let Err(e) = crate::window_tracker::add_tokens_all_horizons(
            &self.window_tracker,
            &admitted.tenant_id,
            &admitted.provider,
            &admitted.model,
            admitted.tier,
            tokens,
        ) {
            warn!(tenant_id = %admitted.tenant_id, error = %e, "failed to record token usage");
            return;
        }

        if admitted.tier != Tier::Pro {
            return;
        }
        let caps = TierCapabilities::for_tier(admitted.tier);
        if !caps.may_queue {
            return;
        }

        let window_tracker = &self.window_tracker;
        let tier = admitted.tier;
        // Reserves the entry's slot (pre-increment) as part of the admit
        // decision itself, so the next candidate's would_exceed check in
        // this same drain sees it — otherwise every candidate in the
        // batch is judged against the same stale window.
        let drained = self.queue.drain_bounded(&admitted.tenant_id, self.config.drain_bound, |entry| {
            match window_tracker.would_exceed(&entry.tenant_id, &entry.provider, &entry.model, Horizon::Minute, tier) {
                Ok(decision) if !decision.exceeded => {
                    if let Err(e) = pre_increment_all_horizons(window_tracker, &entry.tenant_id, &entry.provider, &entry.model, tier) {
                        warn!(tenant_id = %entry.tenant_id, error = %e, "failed to pre-increment drained entry, leaving pending");
                        return false;
                    }
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    warn!(tenant_id = %entry.tenant_id, error = %e, "queue drain check failed, leaving entry pending");
                    false
                }
            }
        });

        match drained {
            Ok(entries) => {
                for entry in entries {
                    if let Err(e) = self.queue.mark_completed(&entry.id) {
                        warn!(queue_id = %entry.id, error = %e, "failed to mark queue entry completed");
                    } else {
                        debug!(queue_id = %entry.id, tenant_id = %entry.tenant_id, "queue entry drained and admitted");
                    }
                }
            }
            Err(e) => warn!(tenant_id = %admitted.tenant_id, error = %e, "queue drain failed"),
        }
    }

    /// Tears down a session's roster entry, optionally kicking off pattern
    /// analysis for pro tenants. Never surfaces an error to the host.
    pub fn session_end(&self, session_id: &str, tenant_id: &str) -> SessionSummary {
        let roster = self.session_rosters.remove(session_id).map(|(_, r)| r).unwrap_or_default();
        let duration_ms = roster
            .started_at
            .map(|start| (Utc::now() - start).num_milliseconds())
            .unwrap_or(0);

        if let Ok(tenant) = self.load_tenant(tenant_id) {
            let now = Utc::now();
            let tier = tenant.effective_tier(now);
            let caps = tenant.capabilities(now);
            if tier == Tier::Pro && caps.may_learn_patterns {
                match self.pattern_detector.analyze(
                    tenant_id,
                    self.config.pattern_lookback_days,
                    self.config.pattern_min_events,
                    self.config.pattern_confidence_threshold,
                ) {
                    Ok(Some(summary)) => info!(tenant_id, patterns = summary.patterns.len(), "pattern analysis complete"),
                    Ok(None) => debug!(tenant_id, "insufficient data for pattern analysis"),
                    Err(e) => warn!(tenant_id, error = %e, "pattern analysis failed"),
                }
            }
        }

        let active_windows = self.window_tracker.active_windows(tenant_id).unwrap_or_default();
        SessionSummary { request_count: roster.request_count, duration_ms, active_windows }
    }

    pub fn status(&self, tenant_id: &str) -> Result<StatusSnapshot> {
        let tenant = self.load_tenant(tenant_id)?;
        let now = Utc::now();
        let tier = tenant.effective_tier(now);
        let capabilities = tenant.capabilities(now);
        let active_windows = self.window_tracker.active_windows(tenant_id)?;
        let queue_size = self.queue.pending_count(tenant_id)?;

        Ok(StatusSnapshot {
            tenant_id: tenant_id.to_string(),
            tier,
            capabilities,
            active_windows,
            queue_size,
            paid_until: tenant.paid_until,
        })
    }

    pub fn patterns(&self, tenant_id: &str, limit: usize) -> Result<Vec<quotaguard_core::Pattern>> {
        self.store.get_patterns(tenant_id, limit)
    }

    pub fn predict(&self, tenant_id: &str) -> Result<Option<crate::pattern_detector::Prediction>> {
        let tenant = self.load_tenant(tenant_id)?;
        if tenant.effective_tier(Utc::now()) != Tier::Pro {
            return Ok(None);
        }
        self.pattern_detector.predict_usage(tenant_id)
    }

    pub fn queue_entries(&self, tenant_id: &str, limit: usize) -> Result<Vec<quotaguard_core::QueueEntry>> {
        self.queue.entries(tenant_id, limit)
    }

    pub fn events(&self, tenant_id: &str, kind: Option<EventKind>, since: DateTime<Utc>) -> Result<Vec<Event>> {
        self.store.get_events(tenant_id, kind, since)
    }

    /// Gated on may-use-custom-limits: refuses with `InvalidInput` rather
    /// than silently writing a ceiling the tenant's tier isn't entitled
    /// to set.
    pub fn set_limit(&self, tenant_id: &str, cfg: &quotaguard_core::LimitConfig) -> Result<()> {
        let tenant = self.load_tenant(tenant_id)?;
        if !tenant.capabilities(Utc::now()).may_use_custom_limits {
            warn!(tenant_id, "set_limit refused: tier does not permit custom limits");
            return Err(CoreError::InvalidInput(format!(
                "tenant {tenant_id} is not entitled to set custom limits"
            )));
        }
        self.store.upsert_limit_config(cfg)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_event(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        kind: EventKind,
        horizon: Option<Horizon>,
        current_count: Option<i64>,
        limit: Option<i64>,
        percent_used: Option<f64>,
        request_id: &str,
        was_queued: bool,
        queue_time_ms: Option<i64>,
    ) {
        let event = Event {
            id: 0,
            tenant_id: tenant_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            timestamp: Utc::now(),
            kind,
            horizon,
            current_count,
            limit,
            percent_used,
            request_id: request_id.to_string(),
            was_queued,
            queue_time_ms,
            detected_pattern_tag: None,
        };
        if let Err(e) = self.store.record_event(&event) {
            warn!(tenant_id, error = %e, "failed to record event");
        }
    }
}

/// `response._cost_metrics.tokens_total`, else `response.usage.total_tokens`,
/// else 0. Absence at any step is not an error.
fn extract_tokens_used(response: &serde_json::Value) -> i64 {
    response
        .get("_cost_metrics")
        .and_then(|v| v.get("tokens_total"))
        .and_then(|v| v.as_i64())
        .or_else(|| response.get("usage").and_then(|v| v.get("total_tokens")).and_then(|v| v.as_i64()))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotaguard_storage::SqliteStore;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn manager() -> Manager {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        let store: Arc<dyn QuotaStore> = Arc::new(SqliteStore::new(path));
        Manager::new(store, GovernorConfig::default())
    }

    #[tokio::test]
    async fn free_tenant_is_blocked_not_queued_on_exceed() {
        let manager = manager();
        manager
            .store
            .upsert_limit_config(&quotaguard_core::LimitConfig {
                provider: "anthropic".into(),
                model: None,
                tier: Tier::Free,
                requests_per_minute: Some(1),
                requests_per_hour: None,
                requests_per_day: None,
                tokens_per_minute: None,
                tokens_per_day: None,
            })
            .unwrap();

        let first = manager.pre_call("r1", "anthropic", "claude", "t1", "s1", None, "{}").await;
        assert!(first.is_ok());

        let second = manager.pre_call("r2", "anthropic", "claude", "t1", "s1", None, "{}").await;
        assert!(matches!(second, Err(CoreError::LimitExceeded(_))));
    }

    #[tokio::test]
    async fn pro_tenant_is_queued_on_exceed() {
        let manager = manager();
        manager.store.upsert_tenant(&Tenant {
            tenant_id: "t1".into(),
            tier: Tier::Pro,
            paid_until: Some(Utc::now() + chrono::Duration::days(30)),
            base_rpm: 100,
            max_queue_size_override: None,
        }).unwrap();
        manager
            .store
            .upsert_limit_config(&quotaguard_core::LimitConfig {
                provider: "anthropic".into(),
                model: None,
                tier: Tier::Pro,
                requests_per_minute: Some(1),
                requests_per_hour: None,
                requests_per_day: None,
                tokens_per_minute: None,
                tokens_per_day: None,
            })
            .unwrap();

        manager.pre_call("r1", "anthropic", "claude", "t1", "s1", None, "{}").await.unwrap();
        let second = manager.pre_call("r2", "anthropic", "claude", "t1", "s1", None, "{}").await;
        assert!(matches!(second, Err(CoreError::Queued(_))));
    }

    #[tokio::test]
    async fn set_limit_refused_for_free_tenant() {
        let manager = manager();
        manager.load_tenant("t1").unwrap();

        let result = manager.set_limit("t1", &quotaguard_core::LimitConfig {
            provider: "anthropic".into(),
            model: None,
            tier: Tier::Free,
            requests_per_minute: Some(1),
            requests_per_hour: None,
            requests_per_day: None,
            tokens_per_minute: None,
            tokens_per_day: None,
        });
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn set_limit_allowed_for_pro_tenant() {
        let manager = manager();
        manager.store.upsert_tenant(&Tenant {
            tenant_id: "t1".into(),
            tier: Tier::Pro,
            paid_until: Some(Utc::now() + chrono::Duration::days(30)),
            base_rpm: 100,
            max_queue_size_override: None,
        }).unwrap();

        manager.set_limit("t1", &quotaguard_core::LimitConfig {
            provider: "anthropic".into(),
            model: None,
            tier: Tier::Pro,
            requests_per_minute: Some(1),
            requests_per_hour: None,
            requests_per_day: None,
            tokens_per_minute: None,
            tokens_per_day: None,
        }).unwrap();
    }

    #[tokio::test]
    async fn post_call_extracts_cost_metrics_before_usage_field() {
        let manager = manager();
        let admitted = manager.pre_call("r1", "anthropic", "claude", "t1", "s1", None, "{}").await.unwrap();
        let response = json!({"_cost_metrics": {"tokens_total": 42}, "usage": {"total_tokens": 999}});
        manager.post_call(Some(&admitted), &response).await;

        let windows = manager.window_tracker.active_windows("t1").unwrap();
        let minute = windows.iter().find(|w| w.horizon == Horizon::Minute).unwrap();
        assert_eq!(minute.token_count, 42);
    }

    #[tokio::test]
    async fn session_end_returns_request_count_and_clears_roster() {
        let manager = manager();
        manager.pre_call("r1", "anthropic", "claude", "t1", "s1", None, "{}").await.unwrap();
        manager.pre_call("r2", "anthropic", "claude", "t1", "s1", None, "{}").await.unwrap();

        let summary = manager.session_end("s1", "t1");
        assert_eq!(summary.request_count, 2);

        let summary2 = manager.session_end("s1", "t1");
        assert_eq!(summary2.request_count, 0);
    }
}
