// crates/core/src/entry.rs
// Log entry model, deterministic ids, and the bit-exact line codec.
//
// The composed line is the durable representation; SQLite only mirrors it.
// Anything that changes the byte layout here breaks stored hashes, so the
// format is frozen:
//
//   [{emoji}] [{ts}] [Agent: {agent}] [Project: {p}] [ID: {id}] {msg} | k=v; k2=v2

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Timestamp layout used inside log lines (UTC, second resolution).
pub const LINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Emojis that classify an entry as a bug regardless of status.
pub const BUG_EMOJIS: [&str; 3] = ["🐛", "🐞", "🪲"];

/// Emojis that classify an entry as security-relevant.
pub const SECURITY_EMOJIS: [&str; 3] = ["🔐", "🔒", "🛡️"];

/// Fallback emoji when neither status nor project defaults resolve one.
pub const DEFAULT_EMOJI: &str = "ℹ️";

/// Fallback agent name.
pub const DEFAULT_AGENT: &str = "Scribe";

/// Entry status values. The set is closed; recovery from unknown input is
/// limited to trim + lowercase before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Info,
    Success,
    Warn,
    Error,
    Bug,
    Plan,
}

impl Status {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "success" => Some(Self::Success),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "bug" => Some(Self::Bug),
            "plan" => Some(Self::Plan),
            _ => None,
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            Self::Info => "ℹ️",
            Self::Success => "✅",
            Self::Warn => "⚠️",
            Self::Error => "❌",
            Self::Bug => "🐞",
            Self::Plan => "🧭",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Bug => "bug",
            Self::Plan => "plan",
        }
    }

    pub fn all() -> [Status; 6] {
        [
            Self::Info,
            Self::Success,
            Self::Warn,
            Self::Error,
            Self::Bug,
            Self::Plan,
        ]
    }
}

/// A parsed or about-to-be-written log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub ts: DateTime<Utc>,
    pub emoji: String,
    pub agent: String,
    pub project: String,
    pub entry_id: Option<String>,
    pub message: String,
    /// Metadata pairs in insertion order (the order they appear on the line).
    pub meta: Vec<(String, String)>,
}

/// Sanitize a metadata key: spaces become `_`, anything outside
/// `[A-Za-z0-9_.:-]` is stripped.
pub fn sanitize_meta_key(key: &str) -> String {
    key.trim()
        .chars()
        .filter_map(|ch| {
            if ch == ' ' {
                Some('_')
            } else if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | ':' | '-') {
                Some(ch)
            } else {
                None
            }
        })
        .collect()
}

/// Clean a metadata value for line embedding: pipes and newlines become
/// spaces so the `|` separator and line framing stay parseable.
pub fn clean_meta_value(value: &str) -> String {
    value
        .replace(['\r', '\n'], " ")
        .replace('|', " ")
        .trim()
        .to_string()
}

/// Sanitize message text for single-line storage.
pub fn sanitize_message(message: &str) -> String {
    message
        .replace("\r\n", "\\n")
        .replace(['\r', '\n'], "\\n")
}

/// Deterministic entry id: first 32 hex chars of
/// `SHA-256(repo_slug|project_slug|ts|agent|message|meta_sha)` where
/// `meta_sha` hashes the pairs sorted by key as `k=v|k2=v2`.
pub fn deterministic_entry_id(
    repo_slug: &str,
    project_slug: &str,
    timestamp: &str,
    agent: &str,
    message: &str,
    meta: &[(String, String)],
) -> String {
    let mut sorted: Vec<&(String, String)> = meta.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let meta_str = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("|");
    let meta_sha = hex::encode(Sha256::digest(meta_str.as_bytes()));

    let combined = [repo_slug, project_slug, timestamp, agent, message, &meta_sha].join("|");
    let full = hex::encode(Sha256::digest(combined.as_bytes()));
    full[..32].to_string()
}

/// Format a UTC timestamp the way log lines carry it.
pub fn format_line_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(LINE_TIMESTAMP_FORMAT).to_string()
}

/// Parse the line timestamp layout back into UTC.
pub fn parse_line_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let stripped = text.strip_suffix(" UTC")?;
    let naive = NaiveDateTime::parse_from_str(stripped, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Compose the exact bytes of a log line (without the trailing newline).
pub fn compose_line(
    emoji: &str,
    timestamp: &str,
    agent: &str,
    project: &str,
    entry_id: Option<&str>,
    message: &str,
    meta: &[(String, String)],
) -> String {
    let mut segments = vec![
        format!("[{emoji}]"),
        format!("[{timestamp}]"),
        format!("[Agent: {agent}]"),
        format!("[Project: {project}]"),
    ];
    if let Some(id) = entry_id {
        segments.push(format!("[ID: {id}]"));
    }
    segments.push(message.to_string());
    let base = segments.join(" ");
    if meta.is_empty() {
        base
    } else {
        let meta_text = meta
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        format!("{base} | {meta_text}")
    }
}

/// Parse a composed log line back into an [`EntryRecord`].
///
/// Returns `None` for lines that are not ledger entries (headers, blanks,
/// free-form text) so callers can stream whole files through this.
pub fn parse_line(line: &str) -> Option<EntryRecord> {
    let rest = line.strip_prefix('[')?;
    let (emoji, rest) = rest.split_once("] [")?;
    let (ts_text, rest) = rest.split_once("] [Agent: ")?;
    let (agent, rest) = rest.split_once("] [Project: ")?;
    let (project, rest) = rest.split_once("] ")?;

    let ts = parse_line_timestamp(ts_text)?;

    let (entry_id, body) = match rest.strip_prefix("[ID: ") {
        Some(after) => {
            let (id, body) = after.split_once("] ")?;
            (Some(id.to_string()), body)
        }
        None => (None, rest),
    };

    let (message, meta) = split_meta_suffix(body);

    Some(EntryRecord {
        ts,
        emoji: emoji.to_string(),
        agent: agent.to_string(),
        project: project.to_string(),
        entry_id,
        message,
        meta,
    })
}

/// Split the trailing ` | k=v; k2=v2` suffix off a message body. The split
/// point is the last ` | ` whose right side parses entirely as pairs; a
/// message containing a literal pipe stays intact.
fn split_meta_suffix(body: &str) -> (String, Vec<(String, String)>) {
    if let Some(idx) = body.rfind(" | ") {
        let (message, suffix) = body.split_at(idx);
        let suffix = &suffix[3..];
        if let Some(pairs) = parse_meta_pairs(suffix) {
            return (message.to_string(), pairs);
        }
    }
    (body.to_string(), Vec::new())
}

fn parse_meta_pairs(text: &str) -> Option<Vec<(String, String)>> {
    if text.trim().is_empty() {
        return None;
    }
    let mut pairs = Vec::new();
    for token in text.split("; ") {
        let (key, value) = token.split_once('=')?;
        if key.is_empty() || sanitize_meta_key(key) != key {
            return None;
        }
        pairs.push((key.to_string(), value.to_string()));
    }
    Some(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn status_parse_is_trim_and_lowercase_only() {
        assert_eq!(Status::parse("  Success "), Some(Status::Success));
        assert_eq!(Status::parse("BUG"), Some(Status::Bug));
        // Near matches are not healed.
        assert_eq!(Status::parse("sucess"), None);
        assert_eq!(Status::parse("warning"), None);
    }

    #[test]
    fn status_emoji_table() {
        assert_eq!(Status::Info.emoji(), "ℹ️");
        assert_eq!(Status::Success.emoji(), "✅");
        assert_eq!(Status::Warn.emoji(), "⚠️");
        assert_eq!(Status::Error.emoji(), "❌");
        assert_eq!(Status::Bug.emoji(), "🐞");
        assert_eq!(Status::Plan.emoji(), "🧭");
    }

    #[test]
    fn meta_key_sanitation() {
        assert_eq!(sanitize_meta_key("bad key|value"), "bad_keyvalue");
        assert_eq!(sanitize_meta_key("component"), "component");
        assert_eq!(sanitize_meta_key("a.b:c-d_e"), "a.b:c-d_e");
        assert_eq!(sanitize_meta_key("héllo"), "hllo");
    }

    #[test]
    fn meta_value_cleaning() {
        assert_eq!(clean_meta_value("a|b"), "a b");
        assert_eq!(clean_meta_value("line1\nline2"), "line1 line2");
        assert_eq!(clean_meta_value("  spaced  "), "spaced");
    }

    #[test]
    fn entry_id_is_deterministic() {
        let meta = vec![
            ("component".to_string(), "parser".to_string()),
            ("phase".to_string(), "3".to_string()),
        ];
        let a = deterministic_entry_id(
            "my-repo",
            "demo",
            "2026-01-05 12:00:00 UTC",
            "Scribe",
            "Parser rewritten",
            &meta,
        );
        let b = deterministic_entry_id(
            "my-repo",
            "demo",
            "2026-01-05 12:00:00 UTC",
            "Scribe",
            "Parser rewritten",
            &meta,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn entry_id_ignores_meta_insertion_order() {
        let forward = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        let backward = vec![
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ];
        let id_fwd = deterministic_entry_id("r", "p", "t", "ag", "msg", &forward);
        let id_bwd = deterministic_entry_id("r", "p", "t", "ag", "msg", &backward);
        assert_eq!(id_fwd, id_bwd);
    }

    #[test]
    fn entry_id_changes_with_any_field() {
        let meta = vec![];
        let base = deterministic_entry_id("r", "p", "t", "ag", "msg", &meta);
        assert_ne!(base, deterministic_entry_id("r2", "p", "t", "ag", "msg", &meta));
        assert_ne!(base, deterministic_entry_id("r", "p", "t2", "ag", "msg", &meta));
        assert_ne!(base, deterministic_entry_id("r", "p", "t", "ag", "msg2", &meta));
    }

    #[test]
    fn compose_matches_spec_layout() {
        let meta = vec![
            ("component".to_string(), "parser".to_string()),
            ("phase".to_string(), "3".to_string()),
        ];
        let line = compose_line(
            "✅",
            "2026-01-05 12:00:00 UTC",
            "Scribe",
            "demo",
            Some("deadbeefdeadbeefdeadbeefdeadbeef"),
            "Parser rewritten",
            &meta,
        );
        assert_eq!(
            line,
            "[✅] [2026-01-05 12:00:00 UTC] [Agent: Scribe] [Project: demo] \
             [ID: deadbeefdeadbeefdeadbeefdeadbeef] Parser rewritten | component=parser; phase=3"
        );
    }

    #[test]
    fn compose_omits_empty_meta_and_id() {
        let line = compose_line(
            "ℹ️",
            "2026-01-05 12:00:00 UTC",
            "Scribe",
            "demo",
            None,
            "Just a note",
            &[],
        );
        assert_eq!(
            line,
            "[ℹ️] [2026-01-05 12:00:00 UTC] [Agent: Scribe] [Project: demo] Just a note"
        );
    }

    #[test]
    fn parse_round_trips_compose() {
        let meta = vec![
            ("severity".to_string(), "high".to_string()),
            ("component".to_string(), "auth".to_string()),
        ];
        let line = compose_line(
            "🐞",
            "2026-02-10 08:30:00 UTC",
            "TriageBot",
            "payments",
            Some("0123456789abcdef0123456789abcdef"),
            "Null deref in token refresh",
            &meta,
        );
        let record = parse_line(&line).expect("line should parse");
        assert_eq!(record.emoji, "🐞");
        assert_eq!(record.agent, "TriageBot");
        assert_eq!(record.project, "payments");
        assert_eq!(
            record.entry_id.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert_eq!(record.message, "Null deref in token refresh");
        assert_eq!(record.meta, meta);
        assert_eq!(format_line_timestamp(record.ts), "2026-02-10 08:30:00 UTC");
    }

    #[test]
    fn parse_without_id_segment() {
        let line = "[ℹ️] [2026-01-01 00:00:00 UTC] [Agent: A] [Project: p] hello world";
        let record = parse_line(line).unwrap();
        assert_eq!(record.entry_id, None);
        assert_eq!(record.message, "hello world");
        assert!(record.meta.is_empty());
    }

    #[test]
    fn parse_rejects_non_entry_lines() {
        assert!(parse_line("# Progress Log").is_none());
        assert!(parse_line("").is_none());
        assert!(parse_line("random prose with [brackets]").is_none());
        assert!(parse_line("[x] [not a timestamp] [Agent: a] [Project: p] m").is_none());
    }

    #[test]
    fn message_with_literal_pipe_is_not_split() {
        let line = "[ℹ️] [2026-01-01 00:00:00 UTC] [Agent: A] [Project: p] ran cat file | grep foo";
        let record = parse_line(line).unwrap();
        // Right side has no '=' pairs, so the pipe belongs to the message.
        assert_eq!(record.message, "ran cat file | grep foo");
        assert!(record.meta.is_empty());
    }

    proptest! {
        #[test]
        fn prop_compose_parse_round_trip(
            message in "[a-zA-Z0-9 ,.!?-]{1,60}",
            agent in "[A-Za-z][A-Za-z0-9_-]{0,15}",
            project in "[a-z][a-z0-9-]{0,15}",
            keys in proptest::collection::vec("[a-z][a-z0-9_]{0,8}", 0..4),
        ) {
            let meta: Vec<(String, String)> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| (format!("{k}{i}"), format!("v{i}")))
                .collect();
            let line = compose_line(
                "✅",
                "2026-01-05 12:00:00 UTC",
                &agent,
                &project,
                Some("deadbeefdeadbeefdeadbeefdeadbeef"),
                message.trim(),
                &meta,
            );
            if message.trim().is_empty() {
                return Ok(());
            }
            let record = parse_line(&line).expect("composed lines parse");
            prop_assert_eq!(record.message, message.trim());
            prop_assert_eq!(record.agent, agent);
            prop_assert_eq!(record.project, project);
            prop_assert_eq!(record.meta, meta);
        }

        #[test]
        fn prop_entry_id_stable(
            message in ".{0,80}",
            agent in "[A-Za-z0-9 ]{1,16}",
        ) {
            let meta = vec![("k".to_string(), "v".to_string())];
            let a = deterministic_entry_id("repo", "proj", "2026-01-01 00:00:00 UTC", &agent, &message, &meta);
            let b = deterministic_entry_id("repo", "proj", "2026-01-01 00:00:00 UTC", &agent, &message, &meta);
            prop_assert_eq!(a, b);
        }
    }
}
