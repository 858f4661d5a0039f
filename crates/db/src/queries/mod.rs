// crates/db/src/queries/mod.rs
// Query modules, one per table group.

pub mod doc_changes;
pub mod entries;
pub mod projects;
pub mod rotations;
pub mod sessions;

use chrono::{DateTime, SecondsFormat, Utc};

/// Canonical timestamp encoding for TEXT columns: RFC 3339 with `Z`,
/// second resolution. Lexicographic order equals chronological order.
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp back to UTC.
pub fn decode_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ts_encoding_round_trips_and_sorts() {
        let a = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 1).unwrap();
        let ea = encode_ts(a);
        let eb = encode_ts(b);
        assert_eq!(ea, "2026-01-05T12:00:00Z");
        assert!(ea < eb);
        assert_eq!(decode_ts(&ea), Some(a));
    }
}
