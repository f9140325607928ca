//! Environment-driven configuration for the quota governor.
//!
//! Every field has a documented default and falls back to it on a
//! malformed value, logging a warning rather than failing host startup.

/// Default path to the SQLite database file.
pub const DEFAULT_DB_PATH: &str = "quotaguard.db";

/// Default max in-flight age (seconds) before a queue entry expires.
pub const DEFAULT_QUEUE_MAX_AGE_SECS: u64 = 1800;

/// Default max entries drained per post-call.
pub const DEFAULT_DRAIN_BOUND: usize = 5;

/// Default lookback horizon (days) for pattern analysis.
pub const DEFAULT_PATTERN_LOOKBACK_DAYS: i64 = 7;

/// Default minimum events required before analysis runs.
pub const DEFAULT_PATTERN_MIN_EVENTS: usize = 10;

/// Default per-analysis confidence cutoff.
pub const DEFAULT_PATTERN_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Default event prune horizon (days).
pub const DEFAULT_EVENT_RETENTION_DAYS: i64 = 30;

/// Default terminal queue-entry prune horizon (days).
pub const DEFAULT_QUEUE_RETENTION_DAYS: i64 = 7;

/// Default deactivated-window prune horizon (days).
pub const DEFAULT_WINDOW_RETENTION_DAYS: i64 = 7;

/// Default background housekeeping sweep interval (seconds).
pub const DEFAULT_HOUSEKEEPING_INTERVAL_SECS: u64 = 3600;

/// Governor-wide configuration.
///
/// # Environment Variables
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `QUOTAGUARD_DB_PATH` | `quotaguard.db` | path to the SQLite file |
/// | `QUOTAGUARD_QUEUE_MAX_AGE_SECS` | 1800 | max in-flight age before an entry expires |
/// | `QUOTAGUARD_DRAIN_BOUND` | 5 | max entries drained per post-call |
/// | `QUOTAGUARD_PATTERN_LOOKBACK_DAYS` | 7 | lookback horizon for pattern analysis |
/// | `QUOTAGUARD_PATTERN_MIN_EVENTS` | 10 | minimum events before analysis runs |
/// | `QUOTAGUARD_PATTERN_CONFIDENCE_THRESHOLD` | 0.6 | per-analysis confidence cutoff |
/// | `QUOTAGUARD_EVENT_RETENTION_DAYS` | 30 | event prune horizon |
/// | `QUOTAGUARD_QUEUE_RETENTION_DAYS` | 7 | terminal queue-entry prune horizon |
/// | `QUOTAGUARD_WINDOW_RETENTION_DAYS` | 7 | deactivated-window prune horizon |
/// | `QUOTAGUARD_HOUSEKEEPING_INTERVAL_SECS` | 3600 | background sweep interval |
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub db_path: String,
    pub queue_max_age_secs: u64,
    pub drain_bound: usize,
    pub pattern_lookback_days: i64,
    pub pattern_min_events: usize,
    pub pattern_confidence_threshold: f64,
    pub event_retention_days: i64,
    pub queue_retention_days: i64,
    pub window_retention_days: i64,
    pub housekeeping_interval_secs: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            queue_max_age_secs: DEFAULT_QUEUE_MAX_AGE_SECS,
            drain_bound: DEFAULT_DRAIN_BOUND,
            pattern_lookback_days: DEFAULT_PATTERN_LOOKBACK_DAYS,
            pattern_min_events: DEFAULT_PATTERN_MIN_EVENTS,
            pattern_confidence_threshold: DEFAULT_PATTERN_CONFIDENCE_THRESHOLD,
            event_retention_days: DEFAULT_EVENT_RETENTION_DAYS,
            queue_retention_days: DEFAULT_QUEUE_RETENTION_DAYS,
            window_retention_days: DEFAULT_WINDOW_RETENTION_DAYS,
            housekeeping_interval_secs: DEFAULT_HOUSEKEEPING_INTERVAL_SECS,
        }
    }
}

impl GovernorConfig {
    /// Build a configuration from environment variables, falling back to
    /// documented defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("QUOTAGUARD_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string()),
            queue_max_age_secs: env_parse("QUOTAGUARD_QUEUE_MAX_AGE_SECS", DEFAULT_QUEUE_MAX_AGE_SECS),
            drain_bound: env_parse("QUOTAGUARD_DRAIN_BOUND", DEFAULT_DRAIN_BOUND),
            pattern_lookback_days: env_parse("QUOTAGUARD_PATTERN_LOOKBACK_DAYS", DEFAULT_PATTERN_LOOKBACK_DAYS),
            pattern_min_events: env_parse("QUOTAGUARD_PATTERN_MIN_EVENTS", DEFAULT_PATTERN_MIN_EVENTS),
            pattern_confidence_threshold: env_parse(
                "QUOTAGUARD_PATTERN_CONFIDENCE_THRESHOLD",
                DEFAULT_PATTERN_CONFIDENCE_THRESHOLD,
            ),
            event_retention_days: env_parse("QUOTAGUARD_EVENT_RETENTION_DAYS", DEFAULT_EVENT_RETENTION_DAYS),
            queue_retention_days: env_parse("QUOTAGUARD_QUEUE_RETENTION_DAYS", DEFAULT_QUEUE_RETENTION_DAYS),
            window_retention_days: env_parse("QUOTAGUARD_WINDOW_RETENTION_DAYS", DEFAULT_WINDOW_RETENTION_DAYS),
            housekeeping_interval_secs: env_parse(
                "QUOTAGUARD_HOUSEKEEPING_INTERVAL_SECS",
                DEFAULT_HOUSEKEEPING_INTERVAL_SECS,
            ),
        }
    }
}

/// Parse an environment variable with a default fallback. Logs a warning
/// and keeps the default if the variable is set but doesn't parse.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(variable = key, value = %raw, "invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let config = GovernorConfig::default();
        assert_eq!(config.db_path, "quotaguard.db");
        assert_eq!(config.queue_max_age_secs, 1800);
        assert_eq!(config.drain_bound, 5);
        assert_eq!(config.pattern_min_events, 10);
        assert_eq!(config.pattern_confidence_threshold, 0.6);
    }

    #[test]
    fn env_parse_falls_back_on_malformed_value() {
        std::env::set_var("QUOTAGUARD_TEST_DRAIN_BOUND", "not-a-number");
        let value: usize = env_parse("QUOTAGUARD_TEST_DRAIN_BOUND", 5);
        assert_eq!(value, 5);
        std::env::remove_var("QUOTAGUARD_TEST_DRAIN_BOUND");
    }

    #[test]
    fn env_parse_uses_set_value() {
        std::env::set_var("QUOTAGUARD_TEST_DRAIN_BOUND_2", "42");
        let value: usize = env_parse("QUOTAGUARD_TEST_DRAIN_BOUND_2", 5);
        assert_eq!(value, 42);
        std::env::remove_var("QUOTAGUARD_TEST_DRAIN_BOUND_2");
    }
}
