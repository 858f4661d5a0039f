// crates/server/src/append.rs
// The append pipeline: validate → resolve project → rate-limit → compose →
// rotate-if-needed → journaled append → SQLite mirror → tee fan-out →
// registry touch. Single and bulk modes share the per-entry path.
//
// Validation is strict-then-default: a deterministic canonicalization
// (trim, case, JSON coercion) is applied silently; anything else emits a
// typed warning and falls back to a safe default. User content is never
// rewritten beyond the documented sanitations.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use scribe_core::config::LogTypeConfig;
use scribe_core::entry::{
    clean_meta_value, compose_line, deterministic_entry_id, format_line_timestamp,
    parse_line_timestamp, sanitize_meta_key, Status, BUG_EMOJIS, DEFAULT_AGENT, DEFAULT_EMOJI,
    SECURITY_EMOJIS,
};
use scribe_core::estimator::{blend_ema, ALPHA_ESTIMATE};
use scribe_core::integrity::sha256_hex;
use scribe_core::journal;
use scribe_core::state::FileStats;
use scribe_db::queries::encode_ts;
use scribe_db::EntryRow;

use crate::error::{ToolError, ToolResult};
use crate::projects::{resolve_project, ProjectContext};
use crate::response::ToolResponse;
use crate::rotation::{self, RotationRequest};
use crate::state::AppState;

const MAX_MESSAGE_CHARS: usize = 10_000;
const BULK_CHUNK_SIZE: usize = 50;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppendRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub timestamp_utc: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub log_type: Option<String>,
    // Bulk mode inputs.
    #[serde(default)]
    pub items: Option<String>,
    #[serde(default)]
    pub items_list: Option<Vec<BulkItem>>,
    #[serde(default)]
    pub auto_split: bool,
    #[serde(default)]
    pub split_delimiter: Option<String>,
    #[serde(default)]
    pub stagger_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkItem {
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub timestamp_utc: Option<String>,
    #[serde(default)]
    pub log_type: Option<String>,
}

/// Normalized per-entry parameters after validation.
#[derive(Debug, Clone)]
struct EntryParams {
    message: String,
    status: Option<Status>,
    emoji: Option<String>,
    agent: Option<String>,
    meta: Vec<(String, String)>,
    ts: DateTime<Utc>,
    log_type: String,
}

/// Project-level defaults pulled once per call.
#[derive(Debug, Clone, Default)]
struct ProjectDefaults {
    emoji: Option<String>,
    agent: Option<String>,
}

// ---------------------------------------------------------------------------
// Normalization (strict validators, typed warnings, safe defaults)
// ---------------------------------------------------------------------------

/// Coerce any accepted meta shape into ordered string pairs.
///
/// Accepted shapes: JSON object, array of `[key, value]` pairs, a JSON
/// string encoding either, or a bare `k=v, k2=v2` string. Unparseable
/// input degrades to a `meta_error` pair so the problem is visible in the
/// written line rather than silently dropped.
pub fn normalize_meta(value: Option<&Value>) -> (Vec<(String, String)>, Vec<String>) {
    let mut warnings = Vec::new();
    let Some(value) = value else {
        return (Vec::new(), warnings);
    };

    let value = match value {
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return (Vec::new(), warnings);
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(parsed) => parsed,
                Err(_) => {
                    return (legacy_meta_pairs(trimmed), warnings);
                }
            }
        }
        other => other.clone(),
    };

    let stringify = |v: &Value| -> String {
        match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    };

    match value {
        Value::Null => (Vec::new(), warnings),
        Value::Object(map) => {
            let mut pairs = Vec::new();
            for (key, val) in map {
                let clean_key = sanitize_meta_key(&key);
                if clean_key.is_empty() {
                    warnings.push(format!("meta key {key:?} sanitized to nothing; dropped"));
                    continue;
                }
                if clean_key != key {
                    warnings.push(format!("meta key {key:?} sanitized to {clean_key:?}"));
                }
                pairs.push((clean_key, clean_meta_value(&stringify(&val))));
            }
            (pairs, warnings)
        }
        Value::Array(items) => {
            let mut pairs = Vec::new();
            for item in &items {
                match item.as_array() {
                    Some(pair) if pair.len() == 2 => {
                        let key = sanitize_meta_key(&stringify(&pair[0]));
                        if !key.is_empty() {
                            pairs.push((key, clean_meta_value(&stringify(&pair[1]))));
                        }
                    }
                    _ => {
                        warnings.push("meta array items must be [key, value] pairs".into());
                        return (
                            vec![(
                                "meta_error".into(),
                                "Expected mapping when decoding JSON metadata list".into(),
                            )],
                            warnings,
                        );
                    }
                }
            }
            (pairs, warnings)
        }
        other => {
            warnings.push(format!(
                "meta must be a mapping, got {}",
                type_name(&other)
            ));
            (
                vec![("meta_error".into(), format!("Unsupported metadata type: {}", type_name(&other)))],
                warnings,
            )
        }
    }
}

fn legacy_meta_pairs(raw: &str) -> Vec<(String, String)> {
    if raw.contains('=') {
        let delimiter = if raw.contains(',') { ',' } else { ' ' };
        let mut pairs = Vec::new();
        for token in raw.split(delimiter) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once('=') {
                Some((key, val)) => {
                    let key = sanitize_meta_key(key.trim());
                    if !key.is_empty() {
                        pairs.push((key, clean_meta_value(val.trim())));
                    }
                }
                None => pairs.push(("message".into(), clean_meta_value(token))),
            }
        }
        if !pairs.is_empty() {
            return pairs;
        }
    }
    vec![("message".into(), clean_meta_value(raw))]
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Status recovery is limited to trim + lowercase; anything else warns
/// and drops to no-status (info emoji downstream).
fn normalize_status(raw: Option<&str>) -> (Option<Status>, Option<String>) {
    match raw {
        None => (None, None),
        Some(text) if text.trim().is_empty() => (None, None),
        Some(text) => match Status::parse(text) {
            Some(status) => (Some(status), None),
            None => (
                None,
                Some(format!(
                    "unknown status {text:?}; expected one of info, success, warn, error, bug, plan"
                )),
            ),
        },
    }
}

/// Timestamp: explicit (both line layout and RFC 3339 accepted) or now.
fn normalize_timestamp(raw: Option<&str>) -> (DateTime<Utc>, Option<String>) {
    let now = Utc::now().with_nanosecond_zero();
    match raw {
        None => (now, None),
        Some(text) if text.trim().is_empty() => (now, None),
        Some(text) => {
            let parsed = parse_line_timestamp(text.trim()).or_else(|| {
                DateTime::parse_from_rfc3339(text.trim())
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            });
            match parsed {
                Some(ts) => (ts.with_nanosecond_zero(), None),
                None => (
                    now,
                    Some(format!("unparseable timestamp {text:?}; using now")),
                ),
            }
        }
    }
}

trait SecondResolution {
    fn with_nanosecond_zero(self) -> DateTime<Utc>;
}

impl SecondResolution for DateTime<Utc> {
    fn with_nanosecond_zero(self) -> DateTime<Utc> {
        use chrono::Timelike;
        self.with_nanosecond(0).unwrap_or(self)
    }
}

fn validate_message(message: &str) -> ToolResult<String> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(ToolError::MessageInvalid("message must be non-empty".into()));
    }
    if trimmed.contains('\n') || trimmed.contains('\r') {
        return Err(ToolError::MessageInvalid(
            "message must not contain newlines (use auto_split for multiline input)".into(),
        ));
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ToolError::MessageInvalid(format!(
            "message exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn missing_required_meta(config: &LogTypeConfig, meta: &[(String, String)]) -> Vec<String> {
    config
        .metadata_requirements
        .iter()
        .filter(|required| {
            !meta
                .iter()
                .any(|(k, v)| k == *required && !v.trim().is_empty())
        })
        .cloned()
        .collect()
}

fn should_tee_to_bugs(status: Option<Status>, emoji: &str) -> bool {
    status == Some(Status::Bug) || BUG_EMOJIS.contains(&emoji)
}

fn should_tee_to_security(meta: &[(String, String)], emoji: &str) -> bool {
    let flagged = meta.iter().any(|(k, v)| {
        k == "security_event" && matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
    });
    flagged || SECURITY_EMOJIS.contains(&emoji)
}

fn missing_meta_reminder(target_log_type: &str, missing: &[String]) -> Value {
    let example = match target_log_type {
        "bugs" => "meta={severity:high, component:auth, status:open}",
        "security" => "meta={severity:high, component:auth}",
        _ => "meta={doc:architecture, action:replace_section}",
    };
    json!({
        "kind": "missing_metadata",
        "log_type": target_log_type,
        "missing": missing,
        "example": example,
        "message": format!(
            "Entry not teed to '{target_log_type}': missing {}. Example: {example}",
            missing.join(", ")
        ),
    })
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Outcome of writing one entry (primary plus tees).
#[derive(Debug, Clone)]
struct WrittenEntry {
    entry_id: String,
    path: String,
    tee_paths: Vec<String>,
    meta: Vec<(String, String)>,
    warnings: Vec<(String, String)>,
    reminders: Vec<Value>,
}

/// append_entry tool: single or bulk.
pub async fn append_entry(app: &AppState, req: AppendRequest) -> ToolResult<ToolResponse> {
    let context = resolve_project(
        app,
        req.project.as_deref(),
        req.agent_id.as_deref(),
        req.session_id.as_deref(),
        true,
    )
    .await?
    .expect("require=true never yields None");

    let defaults = project_defaults(app, &context.name).await;

    if is_bulk(&req) {
        return append_bulk(app, &context, &defaults, req).await;
    }

    let message = validate_message(req.message.as_deref().unwrap_or_default())?;
    let mut warnings: Vec<(String, String)> = Vec::new();

    let (status, status_warning) = normalize_status(req.status.as_deref());
    if let Some(w) = status_warning {
        warnings.push(("status_invalid".into(), w));
    }
    let (meta, meta_warnings) = normalize_meta(req.meta.as_ref());
    for w in meta_warnings {
        warnings.push(("meta_normalized".into(), w));
    }
    let (ts, ts_warning) = normalize_timestamp(req.timestamp_utc.as_deref());
    if let Some(w) = ts_warning {
        warnings.push(("timestamp_invalid".into(), w));
    }

    let params = EntryParams {
        message,
        status,
        emoji: req.emoji.clone(),
        agent: req.agent.clone(),
        meta,
        ts,
        log_type: req
            .log_type
            .clone()
            .unwrap_or_else(|| "progress".to_string()),
    };

    app.rate_limiter.check(&context.name).await?;
    let written = write_entry(app, &context, &defaults, &params).await?;

    let mut response = ToolResponse::ok()
        .field("id", written.entry_id.clone())
        .field("path", written.path.clone())
        .field(
            "meta",
            Value::Object(
                written
                    .meta
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect(),
            ),
        );
    if !written.tee_paths.is_empty() {
        response.set_field("paths", json!(written.tee_paths));
    }
    for (code, message) in warnings.into_iter().chain(written.warnings) {
        response.warn(&code, message);
    }
    for reminder in written.reminders {
        response.remind(reminder);
    }
    response.set_field(
        "recent_projects",
        json!(app.state.snapshot().await.recent_projects),
    );
    Ok(response)
}

fn is_bulk(req: &AppendRequest) -> bool {
    req.items_list.as_ref().map(|l| !l.is_empty()).unwrap_or(false)
        || req.items.as_ref().map(|s| !s.trim().is_empty()).unwrap_or(false)
        || (req.auto_split
            && req
                .message
                .as_deref()
                .map(|m| m.contains(req.split_delimiter.as_deref().unwrap_or("\n")))
                .unwrap_or(false))
}

async fn project_defaults(app: &AppState, name: &str) -> ProjectDefaults {
    match app.db.get_project_row(name).await {
        Ok(Some(row)) => {
            let meta = row.meta_value();
            let defaults = meta.get("defaults").cloned().unwrap_or(Value::Null);
            ProjectDefaults {
                emoji: defaults
                    .get("emoji")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                agent: defaults
                    .get("agent")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            }
        }
        _ => ProjectDefaults::default(),
    }
}

/// Write one entry: compose, rotate-if-needed, journaled append, mirror,
/// tees, registry touch. Returns warnings/reminders instead of failing on
/// any non-fatal leg.
async fn write_entry(
    app: &AppState,
    context: &ProjectContext,
    defaults: &ProjectDefaults,
    params: &EntryParams,
) -> ToolResult<WrittenEntry> {
    let log_config = app.settings.log_type(&params.log_type);
    let log_path = context.dir.join(&log_config.file_name);

    // Emoji: explicit -> status map -> project default -> fallback.
    let emoji = params
        .emoji
        .clone()
        .filter(|e| !e.trim().is_empty())
        .or_else(|| params.status.map(|s| s.emoji().to_string()))
        .or_else(|| defaults.emoji.clone())
        .unwrap_or_else(|| DEFAULT_EMOJI.to_string());
    let agent = params
        .agent
        .clone()
        .filter(|a| !a.trim().is_empty())
        .or_else(|| defaults.agent.clone())
        .unwrap_or_else(|| DEFAULT_AGENT.to_string());

    // Metadata requirements gate the primary write.
    let missing = missing_required_meta(&log_config, &params.meta);
    if !missing.is_empty() {
        return Err(ToolError::MetadataRequirementsMissing {
            log_type: log_config.name.clone(),
            missing,
        });
    }

    let ts_str = format_line_timestamp(params.ts);
    let entry_id = deterministic_entry_id(
        &context.repo_slug,
        &context.slug,
        &ts_str,
        &agent,
        &params.message,
        &params.meta,
    );
    let line = compose_line(
        &emoji,
        &ts_str,
        &agent,
        &context.name,
        Some(&entry_id),
        &params.message,
        &params.meta,
    );

    let mut warnings: Vec<(String, String)> = Vec::new();
    let mut reminders: Vec<Value> = Vec::new();

    // Size-threshold auto-rotation, synchronous before the append.
    if app.settings.log_max_bytes > 0 {
        if let Ok(meta) = tokio::fs::metadata(&log_path).await {
            if meta.len() >= app.settings.log_max_bytes {
                let rotation_req = RotationRequest {
                    project: Some(context.name.clone()),
                    log_type: Some(log_config.name.clone()),
                    confirm: true,
                    ..Default::default()
                };
                match rotation::rotate_log(app, rotation_req).await {
                    Ok(_) => debug!(path = %log_path.display(), "size-threshold rotation completed"),
                    Err(e) => warnings.push((
                        "RotationFailure".into(),
                        format!("auto-rotation failed, appending to current file: {e}"),
                    )),
                }
            }
        }
    }

    // Durable append through the WAL journal.
    journal::append_line(&log_path, &line).await?;
    refresh_file_stats(app, context, &log_config.name, &log_path, &line).await;

    // SQLite mirror, best-effort under the storage timeout.
    let row = EntryRow {
        entry_id: entry_id.clone(),
        project_id: 0, // filled below once the project row is known
        ts: encode_ts(params.ts),
        emoji: emoji.clone(),
        agent: agent.clone(),
        message: params.message.clone(),
        meta: Value::Object(
            params
                .meta
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect(),
        )
        .to_string(),
        raw_line: line.clone(),
        sha256: sha256_hex(line.as_bytes()),
        log_type: log_config.name.clone(),
    };
    mirror_entry(app, &context.name, row, &mut warnings).await;

    // Tee fan-out. Never fails the primary write.
    let mut tee_paths = Vec::new();
    let mut tee_targets: Vec<&str> = Vec::new();
    if log_config.name != "bugs" && should_tee_to_bugs(params.status, &emoji) {
        tee_targets.push("bugs");
    }
    if log_config.name != "security" && should_tee_to_security(&params.meta, &emoji) {
        tee_targets.push("security");
    }
    if matches!(log_config.name.as_str(), "bugs" | "security") {
        // Auxiliary logs mirror into progress so one canonical timeline exists.
        tee_targets.push("progress");
    }
    for target in tee_targets {
        match tee_entry(
            app, context, target, &emoji, &ts_str, &agent, &entry_id, params,
        )
        .await
        {
            Ok(Some(path)) => tee_paths.push(path),
            Ok(None) => {}
            Err(TeeSkip::MissingMeta(missing)) => {
                reminders.push(missing_meta_reminder(target, &missing));
            }
            Err(TeeSkip::WriteFailed(message)) => {
                warnings.push(("TeeFailure".into(), message));
            }
        }
    }

    // Registry touch + lifecycle promotion.
    let core_docs_present = context.core_docs_present();
    if let Err(e) = app
        .registry
        .touch_entry(&context.name, &log_config.name, core_docs_present)
        .await
    {
        warnings.push(("RegistryTouchFailure".into(), e.to_string()));
    }
    if let Some(agent_id) = params_agent_id(params) {
        let _ = app.db.touch_agent_recent(&agent_id, &context.name).await;
    }

    app.events
        .entry_created(&context.name, &entry_id, &log_config.name);

    Ok(WrittenEntry {
        entry_id,
        path: log_path.display().to_string(),
        tee_paths,
        meta: params.meta.clone(),
        warnings,
        reminders,
    })
}

// The agent id travels in meta for bulk items; single mode passes it at
// the request level and binds recency in append_entry.
fn params_agent_id(params: &EntryParams) -> Option<String> {
    params
        .meta
        .iter()
        .find(|(k, _)| k == "agent_id")
        .map(|(_, v)| v.clone())
}

enum TeeSkip {
    MissingMeta(Vec<String>),
    WriteFailed(String),
}

async fn tee_entry(
    app: &AppState,
    context: &ProjectContext,
    target_log_type: &str,
    emoji: &str,
    ts_str: &str,
    agent: &str,
    entry_id: &str,
    params: &EntryParams,
) -> Result<Option<String>, TeeSkip> {
    let config = app.settings.log_type(target_log_type);
    let mut meta = params.meta.clone();
    if !meta.iter().any(|(k, _)| k == "log_type") {
        meta.push(("log_type".into(), target_log_type.to_string()));
    }

    let missing = missing_required_meta(&config, &meta);
    if !missing.is_empty() {
        return Err(TeeSkip::MissingMeta(missing));
    }

    let line = compose_line(
        emoji,
        ts_str,
        agent,
        &context.name,
        Some(entry_id),
        &params.message,
        &meta,
    );
    let path = context.dir.join(&config.file_name);
    match journal::append_line(&path, &line).await {
        Ok(_) => Ok(Some(path.display().to_string())),
        Err(e) => Err(TeeSkip::WriteFailed(format!(
            "tee to {target_log_type} failed: {e}"
        ))),
    }
}

async fn mirror_entry(
    app: &AppState,
    project: &str,
    mut row: EntryRow,
    warnings: &mut Vec<(String, String)>,
) {
    let timeout = Duration::from_secs(app.settings.storage_timeout_seconds.max(1));
    let result = tokio::time::timeout(timeout, async {
        let project_row = app
            .db
            .get_project_row(project)
            .await?
            .ok_or_else(|| scribe_db::DbError::ProjectNotFound(project.to_string()))?;
        row.project_id = project_row.id;
        app.db.insert_entry(&row).await
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(error = %e, "mirror insert failed; file remains authoritative");
            warnings.push(("MirrorFailure".into(), e.to_string()));
        }
        Err(_) => {
            warn!(timeout_seconds = timeout.as_secs(), "mirror insert timed out");
            warnings.push((
                "MirrorTimeout".into(),
                format!("mirror write exceeded {}s; continuing without it", timeout.as_secs()),
            ));
        }
    }
}

/// Blend the fresh append into the cached stats the estimator reads.
async fn refresh_file_stats(
    app: &AppState,
    context: &ProjectContext,
    log_type: &str,
    path: &std::path::Path,
    line: &str,
) {
    let Ok(stat) = scribe_core::estimator::stat_snapshot(path) else {
        return;
    };
    let previous = app.state.file_stats(&context.name, log_type).await;
    let observed = (line.len() + 1) as f64;
    // Only an initialized cache can be extended into another precise
    // count. Uninitialized stats store a zero mtime so the estimator
    // never mistakes the seeded count for a cache hit.
    let (line_count, mtime_ns, ema, initialized) = match previous {
        Some(prev) if prev.initialized => (
            prev.line_count + 1,
            stat.mtime_ns,
            Some(blend_ema(prev.ema_bytes_per_line, observed, ALPHA_ESTIMATE)),
            true,
        ),
        _ => (
            stat.size_bytes / (observed as u64).max(1),
            0,
            Some(blend_ema(None, observed, ALPHA_ESTIMATE)),
            false,
        ),
    };
    let stats = FileStats {
        size_bytes: stat.size_bytes,
        line_count,
        ema_bytes_per_line: ema,
        mtime_ns,
        inode: stat.inode,
        source: "append".into(),
        initialized,
    };
    if let Err(e) = app
        .state
        .update_file_stats(&context.name, log_type, stats)
        .await
    {
        warn!(error = %e, "file-stats update failed");
    }
}

// ---------------------------------------------------------------------------
// Bulk mode
// ---------------------------------------------------------------------------

async fn append_bulk(
    app: &AppState,
    context: &ProjectContext,
    defaults: &ProjectDefaults,
    req: AppendRequest,
) -> ToolResult<ToolResponse> {
    let items = collect_bulk_items(&req)?;
    if items.is_empty() {
        return Err(ToolError::MessageInvalid("bulk mode found no items".into()));
    }

    let (inherited_meta, meta_warnings) = normalize_meta(req.meta.as_ref());
    let (inherited_status, _) = normalize_status(req.status.as_deref());
    let (base_ts, _) = normalize_timestamp(req.timestamp_utc.as_deref());
    let stagger = req.stagger_seconds.unwrap_or(0).max(0);

    let mut written_lines: Vec<Value> = Vec::new();
    let mut failed_items: Vec<Value> = Vec::new();
    let mut response = ToolResponse::ok();
    for w in meta_warnings {
        response.warn("meta_normalized", w);
    }

    for (chunk_index, chunk) in items.chunks(BULK_CHUNK_SIZE).enumerate() {
        debug!(chunk = chunk_index, size = chunk.len(), "processing bulk chunk");
        for (offset, item) in chunk.iter().enumerate() {
            let index = chunk_index * BULK_CHUNK_SIZE + offset;
            match prepare_bulk_item(
                item,
                index,
                &req,
                defaults,
                &inherited_meta,
                inherited_status,
                base_ts,
                stagger,
            ) {
                Ok(params) => {
                    let admitted = app.rate_limiter.check(&context.name).await;
                    let result = match admitted {
                        Ok(()) => write_entry(app, context, defaults, &params).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(written) => {
                            for reminder in written.reminders {
                                response.remind(reminder);
                            }
                            for (code, message) in written.warnings {
                                response.warn(&code, message);
                            }
                            written_lines.push(json!({
                                "index": index,
                                "id": written.entry_id,
                                "path": written.path,
                            }));
                        }
                        Err(e) => failed_items.push(json!({
                            "index": index,
                            "error": { "code": e.code(), "message": e.to_string() },
                        })),
                    }
                }
                Err(e) => failed_items.push(json!({
                    "index": index,
                    "error": { "code": e.code(), "message": e.to_string() },
                })),
            }
        }
    }

    let written = written_lines.len();
    response.set_field("written_lines", json!(written_lines));
    response.set_field("failed_items", json!(failed_items));
    response.set_field("written", written as u64);
    response.set_field(
        "recent_projects",
        json!(app.state.snapshot().await.recent_projects),
    );
    Ok(response)
}

fn collect_bulk_items(req: &AppendRequest) -> ToolResult<Vec<BulkItem>> {
    if let Some(list) = &req.items_list {
        if !list.is_empty() {
            return Ok(list.clone());
        }
    }
    if let Some(raw) = &req.items {
        if !raw.trim().is_empty() {
            return serde_json::from_str::<Vec<BulkItem>>(raw).map_err(|e| {
                ToolError::InvalidParameter {
                    field: "items".into(),
                    message: format!("items must be a JSON array of entry objects: {e}"),
                }
            });
        }
    }
    if req.auto_split {
        let delimiter = req.split_delimiter.as_deref().unwrap_or("\n");
        let message = req.message.as_deref().unwrap_or_default();
        return Ok(message
            .split(delimiter)
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .map(|part| BulkItem {
                message: part.to_string(),
                ..Default::default()
            })
            .collect());
    }
    Ok(Vec::new())
}

fn prepare_bulk_item(
    item: &BulkItem,
    index: usize,
    req: &AppendRequest,
    _defaults: &ProjectDefaults,
    inherited_meta: &[(String, String)],
    inherited_status: Option<Status>,
    base_ts: DateTime<Utc>,
    stagger: i64,
) -> ToolResult<EntryParams> {
    let message = validate_message(&item.message)?;

    let (status, _) = normalize_status(item.status.as_deref());
    let status = status.or(inherited_status);

    let (mut meta, _) = normalize_meta(item.meta.as_ref());
    // Inherited pairs fill gaps; the item's own keys win.
    for (key, value) in inherited_meta {
        if !meta.iter().any(|(k, _)| k == key) {
            meta.push((key.clone(), value.clone()));
        }
    }

    let ts = match item.timestamp_utc.as_deref() {
        Some(explicit) if !explicit.trim().is_empty() => normalize_timestamp(Some(explicit)).0,
        _ => base_ts + ChronoDuration::seconds(stagger * index as i64),
    };

    Ok(EntryParams {
        message,
        status,
        emoji: item.emoji.clone().or_else(|| req.emoji.clone()),
        agent: item.agent.clone().or_else(|| req.agent.clone()),
        meta,
        ts,
        log_type: item
            .log_type
            .clone()
            .or_else(|| req.log_type.clone())
            .unwrap_or_else(|| "progress".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn meta_object_normalizes_keys_and_values() {
        let value = json!({"bad key|value": "x", "component": "auth|core"});
        let (pairs, warnings) = normalize_meta(Some(&value));
        assert!(pairs.contains(&("bad_keyvalue".to_string(), "x".to_string())));
        assert!(pairs.contains(&("component".to_string(), "auth core".to_string())));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn meta_json_string_is_coerced() {
        let value = json!(r#"{"severity": "high", "count": 3}"#);
        let (pairs, warnings) = normalize_meta(Some(&value));
        assert!(warnings.is_empty());
        assert!(pairs.contains(&("severity".to_string(), "high".to_string())));
        assert!(pairs.contains(&("count".to_string(), "3".to_string())));
    }

    #[test]
    fn meta_pair_string_is_coerced() {
        let value = json!("severity=high, component=auth");
        let (pairs, _) = normalize_meta(Some(&value));
        assert_eq!(
            pairs,
            vec![
                ("severity".to_string(), "high".to_string()),
                ("component".to_string(), "auth".to_string()),
            ]
        );
    }

    #[test]
    fn meta_bare_string_becomes_message_pair() {
        let (pairs, _) = normalize_meta(Some(&json!("just a note")));
        assert_eq!(pairs, vec![("message".to_string(), "just a note".to_string())]);
    }

    #[test]
    fn meta_scalar_reports_in_band_error() {
        let (pairs, warnings) = normalize_meta(Some(&json!(42)));
        assert_eq!(pairs[0].0, "meta_error");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn meta_pair_array_is_accepted() {
        let value = json!([["component", "parser"], ["phase", 3]]);
        let (pairs, warnings) = normalize_meta(Some(&value));
        assert!(warnings.is_empty());
        assert_eq!(
            pairs,
            vec![
                ("component".to_string(), "parser".to_string()),
                ("phase".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn status_normalization_is_strict() {
        assert_eq!(normalize_status(Some(" BUG ")), (Some(Status::Bug), None));
        let (status, warning) = normalize_status(Some("sucess"));
        assert_eq!(status, None);
        assert!(warning.unwrap().contains("sucess"));
    }

    #[test]
    fn message_validation_rules() {
        assert!(validate_message("fine").is_ok());
        assert!(matches!(
            validate_message(""),
            Err(ToolError::MessageInvalid(_))
        ));
        assert!(matches!(
            validate_message("line1\nline2"),
            Err(ToolError::MessageInvalid(_))
        ));
        let huge = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(
            validate_message(&huge),
            Err(ToolError::MessageInvalid(_))
        ));
    }

    #[test]
    fn tee_predicates() {
        assert!(should_tee_to_bugs(Some(Status::Bug), "✅"));
        assert!(should_tee_to_bugs(None, "🐞"));
        assert!(!should_tee_to_bugs(Some(Status::Info), "✅"));

        let meta = vec![("security_event".to_string(), "true".to_string())];
        assert!(should_tee_to_security(&meta, "✅"));
        assert!(should_tee_to_security(&[], "🔒"));
        assert!(!should_tee_to_security(&[], "✅"));
    }

    #[test]
    fn bulk_items_from_auto_split() {
        let req = AppendRequest {
            message: Some("one\ntwo\n\nthree".into()),
            auto_split: true,
            ..Default::default()
        };
        assert!(is_bulk(&req));
        let items = collect_bulk_items(&req).unwrap();
        let messages: Vec<&str> = items.iter().map(|i| i.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    #[test]
    fn bulk_items_from_json_string() {
        let req = AppendRequest {
            items: Some(r#"[{"message": "a"}, {"message": "b", "status": "bug"}]"#.into()),
            ..Default::default()
        };
        let items = collect_bulk_items(&req).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].status.as_deref(), Some("bug"));

        let bad = AppendRequest {
            items: Some("not json".into()),
            ..Default::default()
        };
        assert!(collect_bulk_items(&bad).is_err());
    }

    #[test]
    fn bulk_item_staggers_timestamps_and_inherits_meta() {
        let req = AppendRequest::default();
        let base = Utc::now();
        let inherited = vec![("phase".to_string(), "3".to_string())];
        let item = BulkItem {
            message: "work".into(),
            meta: Some(json!({"component": "db"})),
            ..Default::default()
        };

        let params = prepare_bulk_item(
            &item,
            4,
            &req,
            &ProjectDefaults::default(),
            &inherited,
            None,
            base,
            2,
        )
        .unwrap();
        assert_eq!(params.ts, base + ChronoDuration::seconds(8));
        assert!(params.meta.contains(&("component".to_string(), "db".to_string())));
        assert!(params.meta.contains(&("phase".to_string(), "3".to_string())));
    }
}
