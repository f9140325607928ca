//! Sliding-window accounting for the quota governor.
//!
//! Maintains one active window per (tenant, provider, model, horizon),
//! request-anchored rather than wall-clock aligned: a window's lifetime
//! begins at the instant of the admission that needed one, not at a
//! fixed boundary. This avoids the double-burst artefact fixed windows
//! exhibit at their reset instant.
//!
//! The tracker holds no cache of its own — every read and write goes
//! through the `QuotaStore`, which is the sole custodian of window state.

use chrono::{DateTime, Utc};
use quotaguard_core::{defaults, Horizon, Result, Tier, Window};
use quotaguard_storage::QuotaStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a `would_exceed` check for one horizon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExceedDecision {
    pub exceeded: bool,
    pub current: i64,
    pub limit: Option<i64>,
    pub percent_used: f64,
}

pub struct WindowTracker {
    store: Arc<dyn QuotaStore>,
}

impl WindowTracker {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    /// Ensures an active, unexpired window for the given key, rotating
    /// a stale one if necessary, and returns it.
    fn current_window(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        horizon: Horizon,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<Window> {
        if let Some(window) = self.store.get_current_window(tenant_id, provider, model, horizon)? {
            if !window.is_stale(now) {
                return Ok(window);
            }
            debug!(tenant_id, provider, model, horizon = horizon.as_str(), "rotating stale window");
            self.store.deactivate_window(window.id)?;
            return self.create_window(tenant_id, provider, model, horizon, tier, now);
        }
        self.create_window(tenant_id, provider, model, horizon, tier, now)
    }

    fn create_window(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        horizon: Horizon,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<Window> {
        let cfg = self
            .store
            .get_limit_config(provider, model, tier)?
            .or_else(|| defaults::default_limits(provider, tier));

        let (request_limit, token_limit) = match &cfg {
            Some(cfg) => (cfg.request_limit_for(horizon), cfg.token_limit_for(horizon)),
            None => (None, None),
        };

        let window = Window {
            id: 0,
            tenant_id: tenant_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            horizon,
            start: now,
            end: now + horizon.duration(),
            request_count: 0,
            token_count: 0,
            request_limit,
            token_limit,
            active: true,
        };
        self.store.create_window(&window)
    }

    /// Fetch (creating/rotating as needed) the current window and decide
    /// whether it is already at or past its ceiling.
    pub fn would_exceed(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        horizon: Horizon,
        tier: Tier,
    ) -> Result<ExceedDecision> {
        let now = Utc::now();
        let window = self.current_window(tenant_id, provider, model, horizon, tier, now)?;
        let exceeded = window.would_exceed();
        if exceeded {
            warn!(
                tenant_id, provider, model, horizon = horizon.as_str(),
                current = window.request_count, limit = ?window.request_limit,
                "window would exceed limit"
            );
        }
        let limit = window.request_limit.or(window.token_limit);
        Ok(ExceedDecision {
            exceeded,
            current: window.request_count,
            limit,
            percent_used: window.percent_used(),
        })
    }

    /// Ensures a current window, then request-count += 1, token-count += delta_tokens.
    pub fn increment(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        horizon: Horizon,
        tier: Tier,
        delta_tokens: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let window = self.current_window(tenant_id, provider, model, horizon, tier, now)?;
        self.store.increment_window(window.id, delta_tokens)?;
        Ok(())
    }

    /// Like `increment` but only raises token-count — used post-call to
    /// record true usage without double-counting the request itself.
    pub fn add_tokens(
        &self,
        tenant_id: &str,
        provider: &str,
        model: &str,
        horizon: Horizon,
        tier: Tier,
        delta_tokens: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let window = self.current_window(tenant_id, provider, model, horizon, tier, now)?;
        self.store.add_tokens(window.id, delta_tokens)?;
        Ok(())
    }

    /// Materialised view of all active windows for a tenant.
    pub fn active_windows(&self, tenant_id: &str) -> Result<Vec<Window>> {
        self.store.get_active_windows(tenant_id)
    }
}

/// Runs `would_exceed` across minute, hour, day in that order and
/// returns the first refusal, if any.
pub fn would_exceed_any_horizon(
    tracker: &WindowTracker,
    tenant_id: &str,
    provider: &str,
    model: &str,
    tier: Tier,
) -> Result<Option<(Horizon, ExceedDecision)>> {
    for horizon in Horizon::ALL {
        let decision = tracker.would_exceed(tenant_id, provider, model, horizon, tier)?;
        if decision.exceeded {
            return Ok(Some((horizon, decision)));
        }
    }
    Ok(None)
}

/// Pre-increments every horizon's window with delta_tokens = 0, reserving
/// the admitted request's slot before the provider call proceeds.
pub fn pre_increment_all_horizons(
    tracker: &WindowTracker,
    tenant_id: &str,
    provider: &str,
    model: &str,
    tier: Tier,
) -> Result<()> {
    for horizon in Horizon::ALL {
        tracker.increment(tenant_id, provider, model, horizon, tier, 0)?;
    }
    Ok(())
}

/// Adds the true token usage to every horizon's window post-call.
pub fn add_tokens_all_horizons(
    tracker: &WindowTracker,
    tenant_id: &str,
    provider: &str,
    model: &str,
    tier: Tier,
    delta_tokens: i64,
) -> Result<()> {
    for horizon in Horizon::ALL {
        tracker.add_tokens(tenant_id, provider, model, horizon, tier, delta_tokens)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotaguard_core::LimitConfig;
    use quotaguard_storage::SqliteStore;
    use tempfile::NamedTempFile;

    fn tracker() -> WindowTracker {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        let store = Arc::new(SqliteStore::new(path));
        WindowTracker::new(store)
    }

    #[test]
    fn creates_window_on_first_check_using_builtin_defaults() {
        let tracker = tracker();
        let decision = tracker
            .would_exceed("t1", "anthropic", "claude", Horizon::Minute, Tier::Free)
            .unwrap();
        assert!(!decision.exceeded);
        assert_eq!(decision.limit, Some(50));
    }

    #[test]
    fn increment_past_limit_causes_would_exceed() {
        let tracker = tracker();
        tracker
            .store
            .upsert_limit_config(&LimitConfig {
                provider: "anthropic".into(),
                model: None,
                tier: Tier::Free,
                requests_per_minute: Some(2),
                requests_per_hour: None,
                requests_per_day: None,
                tokens_per_minute: None,
                tokens_per_day: None,
            })
            .unwrap();

        for _ in 0..2 {
            tracker
                .increment("t1", "anthropic", "claude", Horizon::Minute, Tier::Free, 0)
                .unwrap();
        }

        let decision = tracker
            .would_exceed("t1", "anthropic", "claude", Horizon::Minute, Tier::Free)
            .unwrap();
        assert!(decision.exceeded);
        assert_eq!(decision.current, 2);
    }

    #[test]
    fn add_tokens_does_not_touch_request_count() {
        let tracker = tracker();
        tracker
            .increment("t1", "anthropic", "claude", Horizon::Minute, Tier::Free, 0)
            .unwrap();
        tracker
            .add_tokens("t1", "anthropic", "claude", Horizon::Minute, Tier::Free, 500)
            .unwrap();

        let windows = tracker.active_windows("t1").unwrap();
        let w = windows.iter().find(|w| w.horizon == Horizon::Minute).unwrap();
        assert_eq!(w.request_count, 1);
        assert_eq!(w.token_count, 500);
    }

    #[test]
    fn would_exceed_any_horizon_reports_first_refusal_in_order() {
        let tracker = tracker();
        tracker
            .store
            .upsert_limit_config(&LimitConfig {
                provider: "anthropic".into(),
                model: None,
                tier: Tier::Free,
                requests_per_minute: Some(1),
                requests_per_hour: None,
                requests_per_day: Some(1000),
                tokens_per_minute: None,
                tokens_per_day: None,
            })
            .unwrap();
        tracker
            .increment("t1", "anthropic", "claude", Horizon::Minute, Tier::Free, 0)
            .unwrap();

        let result = would_exceed_any_horizon(&tracker, "t1", "anthropic", "claude", Tier::Free).unwrap();
        let (horizon, decision) = result.unwrap();
        assert_eq!(horizon, Horizon::Minute);
        assert!(decision.exceeded);
    }
}
