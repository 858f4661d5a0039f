// crates/core/src/timeparse.rs
// Timestamp parsing for query filters. Accepts ISO-8601 (`Z` or `+00:00`)
// and the ledger's own `YYYY-MM-DD [HH:MM[:SS]] UTC` layouts; date-only
// bounds widen to the start or end of that day depending on which side of
// the range they sit on.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Which side of a time range a value bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

/// Parse a user-supplied time bound into UTC.
pub fn parse_time_bound(text: &str, bound: Bound) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    // ISO-8601 with offset ("2026-01-05T12:00:00Z" / "+00:00").
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    // Ledger layouts, with or without the trailing " UTC".
    let bare = text.strip_suffix(" UTC").unwrap_or(text);
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(bare, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    // Date only: widen to the day boundary for the given side.
    if let Ok(date) = NaiveDate::parse_from_str(bare, "%Y-%m-%d") {
        let naive = match bound {
            Bound::Start => date.and_hms_opt(0, 0, 0)?,
            Bound::End => date.and_hms_micro_opt(23, 59, 59, 999_999)?,
        };
        return Some(Utc.from_utc_datetime(&naive));
    }

    None
}

/// Resolve a symbolic range name relative to `now`.
///
/// Supported: `today`, `last_7d`, `last_30d`.
pub fn symbolic_range(name: &str, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    match name.trim().to_ascii_lowercase().as_str() {
        "today" => {
            let start = Utc.from_utc_datetime(&now.date_naive().and_hms_opt(0, 0, 0)?);
            Some((start, now))
        }
        "last_7d" => Some((now - Duration::days(7), now)),
        "last_30d" => Some((now - Duration::days(30), now)),
        _ => None,
    }
}
