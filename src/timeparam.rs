//! Time parameter normalization for the read API.
//!
//! The write path standardizes on local-time RFC3339. The read path accepts
//! Unix seconds, RFC3339 (with or without fractional seconds), and the
//! JavaScript `toISOString()` shapes, and also tolerates the legacy storage
//! formats older databases may contain.

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// Format a timestamp the way the store persists it: RFC3339 at second
/// precision, local offset.
pub fn format_rfc3339_local(t: DateTime<Local>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Convert a time parameter to RFC3339 for database comparison.
///
/// Accepts:
/// - Unix seconds as a string (e.g. `"1736582400"`)
/// - RFC3339 / RFC3339 with fractional seconds (e.g. `"2026-01-11T12:00:00.000Z"`)
/// - ISO 8601 without an offset
/// - Empty string, returned as-is (no filter)
///
/// Anything else is returned verbatim so callers that already pass stored
/// timestamp strings keep working.
pub fn parse_time_param(param: &str) -> String {
    if param.is_empty() {
        return String::new();
    }

    match parse_time_param_to_time(param) {
        Some(t) => format_rfc3339_local(t),
        None => param.to_string(),
    }
}

/// Convert a time parameter to a local timestamp. Returns `None` when the
/// parameter is empty or unparseable.
pub fn parse_time_param_to_time(param: &str) -> Option<DateTime<Local>> {
    if param.is_empty() {
        return None;
    }

    // Unix seconds, restricted to a plausible range (~2001..~2286) so that
    // bare numbers in other units are not misread.
    if let Ok(ts) = param.parse::<i64>() {
        if ts > 1_000_000_000 && ts < 10_000_000_000 {
            return Local.timestamp_opt(ts, 0).single();
        }
    }

    // RFC3339, with or without fractional seconds.
    if let Ok(t) = DateTime::parse_from_rfc3339(param) {
        return Some(t.with_timezone(&Local));
    }

    // ISO 8601 with milliseconds but a bare "Z" the RFC3339 parser rejected
    // in older inputs, then without milliseconds. Both are treated as UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.3fZ", "%Y-%m-%dT%H:%M:%SZ"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(param, fmt) {
            return Some(Utc.from_utc_datetime(&naive).with_timezone(&Local));
        }
    }

    None
}

/// Parse a timestamp string read back from the database.
///
/// Rows written by this crate are RFC3339; databases created by earlier
/// builds may contain `"%Y-%m-%d %H:%M:%S"` (SQLite DATETIME default) or
/// `"%Y-%m-%dT%H:%M:%SZ"`. All three are accepted; the two offset-less
/// forms are read as UTC.
pub fn parse_stored_timestamp(value: &str) -> Option<DateTime<Local>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Local));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%SZ"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive).with_timezone(&Local));
        }
    }
    None
}
