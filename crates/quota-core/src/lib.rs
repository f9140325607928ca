//! QuotaGuard Core
//!
//! Data model, error taxonomy and SQLite schema shared by every other
//! crate in the workspace. Contains no policy: it describes what a
//! tenant, a window, a queue entry, an event and a pattern *are*, and
//! how they are persisted. Decision-making lives in `quotaguard-engine`.

pub mod defaults;
pub mod migrations;
pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Error taxonomy
// ============================================================================

/// Structured payload for a limit-exceeded decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitExceededInfo {
    pub horizon: Horizon,
    pub current: i64,
    pub limit: i64,
    pub percent_used: f64,
}

/// Structured payload for a queued decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedInfo {
    pub queue_id: String,
    pub horizon: Horizon,
    pub current: i64,
    pub limit: i64,
    pub percent_used: f64,
}

/// Errors produced by any component in the governor.
///
/// The pre-call hook throws these directly to the host, so their
/// payloads stay structured rather than collapsing to a message string.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("limit exceeded on {horizon:?} horizon: {current} >= {limit}", horizon = .0.horizon, current = .0.current, limit = .0.limit)]
    LimitExceeded(LimitExceededInfo),

    #[error("request queued (id={})", .0.queue_id)]
    Queued(QueuedInfo),

    #[error("queueing is disabled for this tenant's tier")]
    QueueDisabled,

    #[error("queue is at capacity")]
    QueueFull,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

// ============================================================================
// Tiers and capabilities
// ============================================================================

/// Per-tenant capability profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Tier::Free),
            "pro" => Some(Tier::Pro),
            _ => None,
        }
    }
}

/// Capability flags derived from a tenant's effective tier.
///
/// Never stored directly — always recomputed from `Tier` so a lapsed
/// `paid_until` immediately revokes pro capabilities without a write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierCapabilities {
    pub may_queue: bool,
    pub max_queue_size: i64,
    pub may_learn_patterns: bool,
    pub may_use_custom_limits: bool,
    pub priority_queue_enabled: bool,
    pub base_rpm: i64,
}

impl TierCapabilities {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => TierCapabilities {
                may_queue: false,
                max_queue_size: 0,
                may_learn_patterns: false,
                may_use_custom_limits: false,
                priority_queue_enabled: false,
                base_rpm: 100,
            },
            Tier::Pro => TierCapabilities {
                may_queue: true,
                max_queue_size: 100,
                may_learn_patterns: true,
                may_use_custom_limits: true,
                priority_queue_enabled: true,
                base_rpm: 100,
            },
        }
    }
}

/// A tenant record as stored by the Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub tier: Tier,
    pub paid_until: Option<DateTime<Utc>>,
    pub base_rpm: i64,
    pub max_queue_size_override: Option<i64>,
}

impl Tenant {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            tier: Tier::Free,
            paid_until: None,
            base_rpm: TierCapabilities::for_tier(Tier::Free).base_rpm,
            max_queue_size_override: None,
        }
    }

    /// The tier actually in effect right now. A stored `pro` tier with an
    /// absent or elapsed `paid_until` is treated as free.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        match (self.tier, self.paid_until) {
            (Tier::Pro, Some(paid_until)) if paid_until > now => Tier::Pro,
            _ => Tier::Free,
        }
    }

    pub fn capabilities(&self, now: DateTime<Utc>) -> TierCapabilities {
        let mut caps = TierCapabilities::for_tier(self.effective_tier(now));
        if let Some(max) = self.max_queue_size_override {
            caps.max_queue_size = max;
        }
        caps
    }
}

// ============================================================================
// Limits
// ============================================================================

/// A configured ceiling for one (provider, model-or-wildcard, tier) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    pub provider: String,
    /// `None` is the provider-wide fallback row.
    pub model: Option<String>,
    pub tier: Tier,
    pub requests_per_minute: Option<i64>,
    pub requests_per_hour: Option<i64>,
    pub requests_per_day: Option<i64>,
    pub tokens_per_minute: Option<i64>,
    pub tokens_per_day: Option<i64>,
}

impl LimitConfig {
    pub fn request_limit_for(&self, horizon: Horizon) -> Option<i64> {
        match horizon {
            Horizon::Minute => self.requests_per_minute,
            Horizon::Hour => self.requests_per_hour,
            Horizon::Day => self.requests_per_day,
        }
    }

    /// The hour horizon has no dedicated token ceiling in the data model.
    pub fn token_limit_for(&self, horizon: Horizon) -> Option<i64> {
        match horizon {
            Horizon::Minute => self.tokens_per_minute,
            Horizon::Hour => None,
            Horizon::Day => self.tokens_per_day,
        }
    }
}

// ============================================================================
// Windows
// ============================================================================

/// Sliding-window horizon. Enforced in this fixed order: minute, hour, day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Minute,
    Hour,
    Day,
}

impl Horizon {
    pub const ALL: [Horizon; 3] = [Horizon::Minute, Horizon::Hour, Horizon::Day];

    pub fn duration(&self) -> chrono::Duration {
        match self {
            Horizon::Minute => chrono::Duration::seconds(60),
            Horizon::Hour => chrono::Duration::seconds(3600),
            Horizon::Day => chrono::Duration::seconds(86400),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::Minute => "minute",
            Horizon::Hour => "hour",
            Horizon::Day => "day",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(Horizon::Minute),
            "hour" => Some(Horizon::Hour),
            "day" => Some(Horizon::Day),
            _ => None,
        }
    }
}

/// One accounting bucket for a (tenant, provider, model, horizon) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub id: i64,
    pub tenant_id: String,
    pub provider: String,
    pub model: String,
    pub horizon: Horizon,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub request_count: i64,
    pub token_count: i64,
    pub request_limit: Option<i64>,
    pub token_limit: Option<i64>,
    pub active: bool,
}

impl Window {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }

    /// Whether this window's current counts exceed its configured ceilings.
    pub fn would_exceed(&self) -> bool {
        let over_requests = self
            .request_limit
            .is_some_and(|limit| self.request_count >= limit);
        let over_tokens = self
            .token_limit
            .is_some_and(|limit| self.token_count >= limit);
        over_requests || over_tokens
    }

    pub fn percent_used(&self) -> f64 {
        let request_pct = self
            .request_limit
            .filter(|&l| l > 0)
            .map(|l| self.request_count as f64 / l as f64 * 100.0);
        let token_pct = self
            .token_limit
            .filter(|&l| l > 0)
            .map(|l| self.token_count as f64 / l as f64 * 100.0);
        match (request_pct, token_pct) {
            (Some(r), Some(t)) => r.max(t),
            (Some(r), None) => r,
            (None, Some(t)) => t,
            (None, None) => 0.0,
        }
    }
}

// ============================================================================
// Queue entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub tenant_id: String,
    pub provider: String,
    pub model: String,
    pub payload: String,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub status: QueueStatus,
    pub queued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

pub const DEFAULT_QUEUE_PRIORITY: i32 = 5;
pub const MIN_QUEUE_PRIORITY: i32 = 1;
pub const MAX_QUEUE_PRIORITY: i32 = 10;
pub const DEFAULT_MAX_RETRIES: i32 = 3;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Allowed,
    Warned,
    Blocked,
    Queued,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Allowed => "allowed",
            EventKind::Warned => "warned",
            EventKind::Blocked => "blocked",
            EventKind::Queued => "queued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allowed" => Some(EventKind::Allowed),
            "warned" => Some(EventKind::Warned),
            "blocked" => Some(EventKind::Blocked),
            "queued" => Some(EventKind::Queued),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub tenant_id: String,
    pub provider: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub horizon: Option<Horizon>,
    pub current_count: Option<i64>,
    pub limit: Option<i64>,
    pub percent_used: Option<f64>,
    pub request_id: String,
    pub was_queued: bool,
    pub queue_time_ms: Option<i64>,
    pub detected_pattern_tag: Option<String>,
}

// ============================================================================
// Patterns
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    TimeOfDay,
    DayOfWeek,
    Burst,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::TimeOfDay => "time-of-day",
            PatternKind::DayOfWeek => "day-of-week",
            PatternKind::Burst => "burst",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "time-of-day" => Some(PatternKind::TimeOfDay),
            "day-of-week" => Some(PatternKind::DayOfWeek),
            "burst" => Some(PatternKind::Burst),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub tenant_id: String,
    pub kind: PatternKind,
    pub label: String,
    pub average_rpm: f64,
    pub peak_rpm: i64,
    pub confidence: f64,
    pub suggested_limit: Option<i64>,
    pub suggested_queue_size: Option<i64>,
    pub observation_count: i64,
    pub first_detected: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pro_tier_lapses_without_paid_until() {
        let mut tenant = Tenant::new("t1");
        tenant.tier = Tier::Pro;
        let now = Utc::now();
        assert_eq!(tenant.effective_tier(now), Tier::Free);

        tenant.paid_until = Some(now - chrono::Duration::seconds(1));
        assert_eq!(tenant.effective_tier(now), Tier::Free);

        tenant.paid_until = Some(now + chrono::Duration::seconds(1));
        assert_eq!(tenant.effective_tier(now), Tier::Pro);
    }

    #[test]
    fn free_tier_capabilities_disable_queueing_and_patterns() {
        let caps = TierCapabilities::for_tier(Tier::Free);
        assert!(!caps.may_queue);
        assert_eq!(caps.max_queue_size, 0);
        assert!(!caps.may_learn_patterns);
    }

    #[test]
    fn window_percent_used_prefers_the_more_saturated_resource() {
        let window = Window {
            id: 1,
            tenant_id: "t1".into(),
            provider: "anthropic".into(),
            model: "claude".into(),
            horizon: Horizon::Minute,
            start: Utc::now(),
            end: Utc::now() + Horizon::Minute.duration(),
            request_count: 10,
            token_count: 900,
            request_limit: Some(50),
            token_limit: Some(1000),
            active: true,
        };
        assert!((window.percent_used() - 90.0).abs() < 1e-9);
    }
}
