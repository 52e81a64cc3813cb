//! Liberal timestamp parsing
//!
//! Shared by the type inferencer, the filter engine (datetime
//! comparison values) and the sort engine. Accepts RFC 3339 plus the
//! common unzoned layouts; naive timestamps are taken as UTC.
//! Precision is milliseconds.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Unzoned layouts tried in order after RFC 3339
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Date-only layouts, resolved to midnight UTC
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Parse a timestamp string to milliseconds since the Unix epoch
pub fn parse_datetime(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.timestamp_millis());
    }

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp_millis());
        }
    }

    None
}

/// Interpret a bare signed integer as an epoch timestamp
///
/// Ten digits are seconds, thirteen are milliseconds; anything else
/// is not an epoch shape.
pub fn parse_epoch_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let value: i64 = trimmed.parse().ok()?;
    match digits.len() {
        10 => Some(value * 1000),
        13 => Some(value),
        _ => None,
    }
}
