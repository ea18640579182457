//! # Input Sanitization
//!
//! Turns untrusted caller-supplied context into a bounded [`ErrorContext`],
//! and scrubs credentials out of messages before they are written to disk.
//!
//! Sanitization never fails: out-of-range numbers are clamped, long strings
//! are truncated, and fields of the wrong type are dropped.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::model::ErrorContext;

pub const MIN_HTTP_STATUS: i64 = 100;
pub const MAX_HTTP_STATUS: i64 = 599;
pub const MAX_RETRY_COUNT: i64 = 100;
pub const MAX_MESSAGE_CHARS: usize = 1000;
pub const MAX_FIELD_CHARS: usize = 100;

// Static regex patterns for sensitive information detection
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // API keys, tokens, credentials
        r#"(?i)(api[_-]?key|token|secret|password|credential)s?["']?\s*[=:]\s*["']?([^"'\s]+)"#,
        // OAuth 2.0 tokens
        r"(?i)bearer\s+([a-zA-Z0-9\._\-]+)",
        // JWTs
        r"eyJ[a-zA-Z0-9\-_]+\.eyJ[a-zA-Z0-9\-_]+\.[a-zA-Z0-9\-_]+",
        // Email addresses
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Sanitizes an arbitrary JSON value into an [`ErrorContext`]
pub fn sanitize_context(raw: &Value) -> ErrorContext {
    let fields = match raw.as_object() {
        Some(fields) => fields,
        None => return ErrorContext::default(),
    };

    ErrorContext {
        http_status: clamped_int(fields, "httpStatus", MIN_HTTP_STATUS, MAX_HTTP_STATUS)
            .map(|s| s as u16),
        error_message: bounded_str(fields, "errorMessage", MAX_MESSAGE_CHARS),
        error_type: bounded_str(fields, "errorType", MAX_FIELD_CHARS),
        source_system: bounded_str(fields, "sourceSystem", MAX_FIELD_CHARS),
        target_system: bounded_str(fields, "targetSystem", MAX_FIELD_CHARS),
        retry_count: clamped_int(fields, "retryCount", 0, MAX_RETRY_COUNT).unwrap_or(0) as u32,
        deployment_id: bounded_str(fields, "deploymentId", MAX_FIELD_CHARS),
    }
}

/// Reads a numeric field and clamps it into `[min, max]`
fn clamped_int(fields: &Map<String, Value>, key: &str, min: i64, max: i64) -> Option<i64> {
    let value = fields.get(key)?;

    if let Some(n) = value.as_i64() {
        return Some(n.clamp(min, max));
    }
    if value.is_u64() {
        // Larger than i64::MAX
        return Some(max);
    }
    value
        .as_f64()
        .filter(|f| f.is_finite())
        .map(|f| (f.trunc().clamp(min as f64, max as f64)) as i64)
}

/// Reads a string field and truncates it to `max_chars` characters
fn bounded_str(fields: &Map<String, Value>, key: &str, max_chars: usize) -> Option<String> {
    fields
        .get(key)?
        .as_str()
        .map(|s| limit_length(s, max_chars))
}

/// Limits a string to `max_chars` characters without splitting a code point
pub fn limit_length(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => input[..byte_idx].to_string(),
        None => input.to_string(),
    }
}

/// Removes credentials, tokens and addresses from a message
pub fn redact_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        sanitized = pattern
            .replace_all(&sanitized, |caps: &regex::Captures| redact_secret(caps))
            .to_string();
    }

    sanitized
}

/// Replaces the last capture group of a match, keeping the text around it.
/// Patterns without groups are replaced whole.
fn redact_secret(caps: &regex::Captures) -> String {
    let whole = &caps[0];
    let Some(secret) = (1..caps.len()).rev().find_map(|i| caps.get(i)) else {
        return "[REDACTED]".to_string();
    };
    let offset = caps.get(0).map_or(0, |m| m.start());
    let (start, end) = (secret.start() - offset, secret.end() - offset);
    format!("{}[REDACTED]{}", &whole[..start], &whole[end..])
}
