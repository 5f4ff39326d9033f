//! Schedule time parsing and idempotency keys
//!
//! Operators hand `poly-queue schedule` anything from `"now"` to
//! `"tomorrow 9am"`; everything is normalized to UTC unix seconds before it
//! reaches the store.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::{PolycastError, Result};

/// Parse a schedule string relative to `now`.
///
/// Supports:
/// - `"now"`
/// - RFC 3339 timestamps: `"2026-11-20T15:00:00Z"`
/// - Unix seconds prefixed with `@`: `"@1763650800"`
/// - Relative durations: `"1h"`, `"30m"`, `"2d"`, `"1 hour"`
/// - Natural language: `"tomorrow"`, `"next monday 10am"`
///
/// Past times are accepted; the entry simply becomes due immediately.
///
/// # Errors
///
/// Returns `InvalidInput` if no format matches.
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(PolycastError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Some(secs) = input.strip_prefix('@') {
        let secs: i64 = secs
            .parse()
            .map_err(|_| PolycastError::InvalidInput(format!("Invalid unix time: {}", input)))?;
        return DateTime::from_timestamp(secs, 0).ok_or_else(|| {
            PolycastError::InvalidInput(format!("Unix time out of range: {}", input))
        });
    }

    if let Ok(duration) = parse_duration(input) {
        return Ok(now + duration);
    }

    if let Ok(dt) = parse_natural_language(input, now) {
        return Ok(dt);
    }

    Err(PolycastError::InvalidInput(format!(
        "Could not parse schedule string: {}",
        input
    )))
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|e| PolycastError::InvalidInput(format!("Could not parse duration: {}", e)))?;
    Duration::from_std(std_duration)
        .map_err(|_| PolycastError::InvalidInput("Duration out of range".to_string()))
}

fn parse_natural_language(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us)
        .map_err(|e| PolycastError::InvalidInput(format!("Could not parse time: {}", e)))
}

/// Key that makes re-submitting the same (content, channel, time) a no-op.
///
/// Hex SHA-256 of the three fields joined with a separator that cannot
/// appear in a uuid or an integer.
pub fn idempotency_key(content_item_id: &str, channel_id: &str, scheduled_for: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content_item_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(channel_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(scheduled_for.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
