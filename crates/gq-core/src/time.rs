//! Time utilities for genqueue
//!
//! Backend timestamps come in several encodings (RFC 3339, naive ISO
//! strings without an offset, Unix seconds). Everything is normalized to
//! `DateTime<Utc>`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Parse a backend timestamp
///
/// Naive timestamps are interpreted as UTC. Returns `None` when the value
/// matches no known encoding.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    // Unix seconds, possibly fractional
    raw.parse::<f64>().ok().and_then(|secs| {
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        let whole = secs.trunc() as i64;
        let nanos = ((secs - secs.trunc()) * 1e9) as u32;
        Utc.timestamp_opt(whole, nanos).single()
    })
}

/// Parse an optional backend timestamp, assigning `now` when it is missing
/// or unparseable
pub fn instant_or(raw: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    match raw.and_then(parse_instant) {
        Some(instant) => instant,
        None => {
            if let Some(raw) = raw {
                tracing::debug!(raw = %raw, "Unparseable timestamp, using insertion time");
            }
            now
        }
    }
}
