//! Input validation for the quota governor
//!
//! Provides validation functions to prevent:
//! - Malformed tenant/provider/model identifiers reaching the Store
//! - Out-of-range priority and retry values corrupting the queue's ordering
//! - Excessively long inputs

use crate::{CoreError, Result, MAX_QUEUE_PRIORITY, MIN_QUEUE_PRIORITY};

/// Maximum length for tenant identifiers
pub const MAX_TENANT_ID_LEN: usize = 100;

/// Maximum length for provider names
pub const MAX_PROVIDER_LEN: usize = 64;

/// Maximum length for model names
pub const MAX_MODEL_LEN: usize = 128;

/// Maximum length for a queued request's serialized payload
pub const MAX_PAYLOAD_LEN: usize = 262_144;

/// Validate a tenant identifier
///
/// Requirements:
/// - Not empty
/// - <= 100 characters
/// - Alphanumeric, underscore, hyphen only
pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    validate_identifier(tenant_id, "tenant_id", MAX_TENANT_ID_LEN)
}

/// Validate a provider name (e.g. "anthropic", "openai", "google")
///
/// Requirements:
/// - Not empty
/// - <= 64 characters
/// - Lowercase alphanumeric, underscore, hyphen only
pub fn validate_provider(provider: &str) -> Result<()> {
    if provider.is_empty() {
        return Err(CoreError::InvalidInput("provider cannot be empty".into()));
    }
    if provider.len() > MAX_PROVIDER_LEN {
        return Err(CoreError::InvalidInput(format!(
            "provider too long: {} > {} characters",
            provider.len(),
            MAX_PROVIDER_LEN
        )));
    }
    if !provider
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(CoreError::InvalidInput(
            "provider contains invalid characters (allowed: lowercase alphanumeric, _, -)".into(),
        ));
    }
    Ok(())
}

/// Validate a model name
///
/// Requirements:
/// - Not empty
/// - <= 128 characters
/// - Alphanumeric, underscore, hyphen, dot, colon only (covers versioned
///   model names such as "claude-3-5-sonnet-20241022" or "gpt-4o:2024-08-06")
pub fn validate_model(model: &str) -> Result<()> {
    if model.is_empty() {
        return Err(CoreError::InvalidInput("model cannot be empty".into()));
    }
    if model.len() > MAX_MODEL_LEN {
        return Err(CoreError::InvalidInput(format!(
            "model too long: {} > {} characters",
            model.len(),
            MAX_MODEL_LEN
        )));
    }
    if !model
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':')
    {
        return Err(CoreError::InvalidInput(
            "model contains invalid characters (allowed: alphanumeric, _, -, ., :)".into(),
        ));
    }
    Ok(())
}

fn validate_identifier(identifier: &str, field_name: &str, max_len: usize) -> Result<()> {
    if identifier.is_empty() {
        return Err(CoreError::InvalidInput(format!(
            "{field_name} cannot be empty"
        )));
    }
    if identifier.len() > max_len {
        return Err(CoreError::InvalidInput(format!(
            "{field_name} too long: {} > {max_len} characters",
            identifier.len()
        )));
    }
    if !identifier
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CoreError::InvalidInput(format!(
            "{field_name} contains invalid characters (allowed: alphanumeric, _, -)"
        )));
    }
    Ok(())
}

/// Validate a queue priority value
///
/// Requirements: integer in `[MIN_QUEUE_PRIORITY, MAX_QUEUE_PRIORITY]`
pub fn validate_priority(priority: i32) -> Result<()> {
    if !(MIN_QUEUE_PRIORITY..=MAX_QUEUE_PRIORITY).contains(&priority) {
        return Err(CoreError::InvalidInput(format!(
            "priority must be between {MIN_QUEUE_PRIORITY} and {MAX_QUEUE_PRIORITY}, got {priority}"
        )));
    }
    Ok(())
}

/// Validate a queued request's serialized payload
pub fn validate_payload(payload: &str) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CoreError::InvalidInput(format!(
            "payload too long: {} > {} bytes",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }
    Ok(())
}
