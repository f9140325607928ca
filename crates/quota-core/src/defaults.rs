//! Built-in limit tables.
//!
//! These are the ceilings a tenant gets before any custom `LimitConfig`
//! row is written for their tier. Pro tenants may override them (subject
//! to `TierCapabilities::may_use_custom_limits`); free tenants cannot.
//! The hour horizon has no built-in ceiling for any provider; it is only
//! ever populated by a custom `LimitConfig`.

use crate::{LimitConfig, Tier};

/// The built-in limit for `(provider, tier)`, or `None` if the provider
/// is unrecognized (callers should fall back to an unlimited config).
pub fn default_limits(provider: &str, tier: Tier) -> Option<LimitConfig> {
    let row = BUILTIN_LIMITS
        .iter()
        .find(|row| row.provider == provider && row.tier == tier)?;
    Some(LimitConfig {
        provider: row.provider.to_string(),
        model: None,
        tier: row.tier,
        requests_per_minute: row.requests_per_minute,
        requests_per_hour: None,
        requests_per_day: row.requests_per_day,
        tokens_per_minute: row.tokens_per_minute,
        tokens_per_day: row.tokens_per_day,
    })
}

struct BuiltinRow {
    provider: &'static str,
    tier: Tier,
    requests_per_minute: Option<i64>,
    requests_per_day: Option<i64>,
    tokens_per_minute: Option<i64>,
    tokens_per_day: Option<i64>,
}

// Mirrors the published rate-limit cards for each provider's lowest and
// mid tiers. A dash in the upstream card becomes `None` (unenforced).
const BUILTIN_LIMITS: &[BuiltinRow] = &[
    BuiltinRow {
        provider: "anthropic",
        tier: Tier::Free,
        requests_per_minute: Some(50),
        requests_per_day: Some(1_000),
        tokens_per_minute: Some(40_000),
        tokens_per_day: Some(300_000),
    },
    BuiltinRow {
        provider: "anthropic",
        tier: Tier::Pro,
        requests_per_minute: Some(1_000),
        requests_per_day: Some(10_000),
        tokens_per_minute: Some(80_000),
        tokens_per_day: Some(2_500_000),
    },
    BuiltinRow {
        provider: "openai",
        tier: Tier::Free,
        requests_per_minute: Some(60),
        requests_per_day: Some(200),
        tokens_per_minute: Some(40_000),
        tokens_per_day: None,
    },
    BuiltinRow {
        provider: "openai",
        tier: Tier::Pro,
        requests_per_minute: Some(500),
        requests_per_day: Some(10_000),
        tokens_per_minute: Some(150_000),
        tokens_per_day: None,
    },
    BuiltinRow {
        provider: "google",
        tier: Tier::Free,
        requests_per_minute: Some(60),
        requests_per_day: Some(1_500),
        tokens_per_minute: None,
        tokens_per_day: None,
    },
    BuiltinRow {
        provider: "google",
        tier: Tier::Pro,
        requests_per_minute: Some(1_000),
        requests_per_day: Some(15_000),
        tokens_per_minute: None,
        tokens_per_day: None,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_provider_and_tier_resolves() {
        let limit = default_limits("anthropic", Tier::Free).unwrap();
        assert_eq!(limit.requests_per_minute, Some(50));
        assert_eq!(limit.requests_per_day, Some(1_000));
        assert_eq!(limit.requests_per_hour, None);
    }

    #[test]
    fn unknown_provider_resolves_to_none() {
        assert!(default_limits("cohere", Tier::Free).is_none());
    }

    #[test]
    fn google_has_no_builtin_token_ceiling() {
        let limit = default_limits("google", Tier::Pro).unwrap();
        assert_eq!(limit.tokens_per_minute, None);
        assert_eq!(limit.tokens_per_day, None);
    }
}
