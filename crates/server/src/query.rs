// crates/server/src/query.rs
// Query engine: multi-scope search over the SQLite mirror with a lazy
// reverse file-scan fallback, filter composition, relevance scoring,
// optional code-reference verification, and pagination.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use scribe_core::entry::{parse_line, Status};
use scribe_core::tail::ReverseLineReader;
use scribe_core::timeparse::{parse_time_bound, symbolic_range, Bound};
use scribe_db::queries::{decode_ts, encode_ts};
use scribe_db::EntryFilters;

use crate::error::{ToolError, ToolResult};
use crate::projects::{project_context, resolve_project};
use crate::response::ToolResponse;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: u64 = 20;
const MAX_PAGE_SIZE: u64 = 200;
const COMPACT_MESSAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub document_types: Option<Vec<String>>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    /// Symbolic range: `today`, `last_7d`, `last_30d`.
    #[serde(default)]
    pub time_range: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// `substring` (default), `regex`, or `exact`.
    #[serde(default)]
    pub message_mode: Option<String>,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub emoji: Vec<String>,
    #[serde(default)]
    pub status: Vec<String>,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub meta_filters: Option<Value>,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub compact: bool,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub include_metadata: Option<bool>,
    #[serde(default)]
    pub relevance_threshold: Option<f64>,
    #[serde(default)]
    pub verify_code_references: bool,
    #[serde(default)]
    pub priority: Vec<String>,
    #[serde(default)]
    pub category: Vec<String>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

/// One matched entry, source-independent.
#[derive(Debug, Clone)]
struct QueryEntry {
    project: String,
    ts: DateTime<Utc>,
    emoji: String,
    agent: String,
    message: String,
    entry_id: Option<String>,
    log_type: String,
    meta: BTreeMap<String, String>,
    /// Section body for document-derived entries.
    content: Option<String>,
    relevance: f64,
}

#[derive(Debug, Clone)]
struct CompiledFilters {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    message: Option<MessageMatcher>,
    emojis: Vec<String>,
    agents: Vec<String>,
    meta_equals: Vec<(String, String)>,
    priority: Vec<String>,
    category: Vec<String>,
    min_confidence: Option<f64>,
}

#[derive(Debug, Clone)]
enum MessageMatcher {
    Substring { needle: String, case_sensitive: bool },
    Regex(Regex),
    Exact { needle: String, case_sensitive: bool },
}

impl MessageMatcher {
    fn matches(&self, text: &str) -> bool {
        match self {
            Self::Substring {
                needle,
                case_sensitive: true,
            } => text.contains(needle.as_str()),
            Self::Substring {
                needle,
                case_sensitive: false,
            } => text.to_lowercase().contains(&needle.to_lowercase()),
            // Anchored at compile time: full-match policy.
            Self::Regex(re) => re.is_match(text),
            Self::Exact {
                needle,
                case_sensitive: true,
            } => text == needle,
            Self::Exact {
                needle,
                case_sensitive: false,
            } => text.eq_ignore_ascii_case(needle),
        }
    }
}

/// Closed status → emoji table used by the `status[]` filter.
fn status_emojis(statuses: &[String]) -> Vec<String> {
    statuses
        .iter()
        .filter_map(|s| Status::parse(s))
        .map(|s| s.emoji().to_string())
        .collect()
}

fn compile_filters(req: &QueryRequest, now: DateTime<Utc>) -> ToolResult<CompiledFilters> {
    let (mut start, mut end) = (None, None);
    if let Some(range) = req.time_range.as_deref() {
        match symbolic_range(range, now) {
            Some((s, e)) => {
                start = Some(s);
                end = Some(e);
            }
            None => {
                return Err(ToolError::InvalidParameter {
                    field: "time_range".into(),
                    message: format!("unknown symbolic range {range:?} (today, last_7d, last_30d)"),
                })
            }
        }
    }
    if let Some(raw) = req.start.as_deref() {
        start = Some(parse_time_bound(raw, Bound::Start).ok_or_else(|| {
            ToolError::InvalidParameter {
                field: "start".into(),
                message: format!("unparseable time bound {raw:?}"),
            }
        })?);
    }
    if let Some(raw) = req.end.as_deref() {
        end = Some(parse_time_bound(raw, Bound::End).ok_or_else(|| {
            ToolError::InvalidParameter {
                field: "end".into(),
                message: format!("unparseable time bound {raw:?}"),
            }
        })?);
    }

    let message = match req.message.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        None => None,
        Some(needle) => Some(match req.message_mode.as_deref().unwrap_or("substring") {
            // Full-match policy: anchor the user pattern.
            "regex" => MessageMatcher::Regex(
                Regex::new(&format!("^(?:{needle})$")).map_err(|e| ToolError::InvalidParameter {
                    field: "message".into(),
                    message: format!("invalid regex: {e}"),
                })?,
            ),
            "exact" => MessageMatcher::Exact {
                needle: needle.to_string(),
                case_sensitive: req.case_sensitive,
            },
            _ => MessageMatcher::Substring {
                needle: needle.to_string(),
                case_sensitive: req.case_sensitive,
            },
        }),
    };

    let mut emojis = req.emoji.clone();
    emojis.extend(status_emojis(&req.status));

    let meta_equals = match req.meta_filters.as_ref() {
        None => Vec::new(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                )
            })
            .collect(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        },
                    )
                })
                .collect(),
            _ => {
                return Err(ToolError::MetadataInvalid(
                    "meta_filters must be a JSON object".into(),
                ))
            }
        },
        Some(_) => {
            return Err(ToolError::MetadataInvalid(
                "meta_filters must be a JSON object".into(),
            ))
        }
    };

    Ok(CompiledFilters {
        start,
        end,
        message,
        emojis,
        agents: req.agents.clone(),
        meta_equals,
        priority: req.priority.clone(),
        category: req.category.clone(),
        min_confidence: req.min_confidence,
    })
}

impl CompiledFilters {
    fn matches(&self, entry: &QueryEntry) -> bool {
        if let Some(start) = self.start {
            if entry.ts < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if entry.ts > end {
                return false;
            }
        }
        if !self.emojis.is_empty() && !self.emojis.contains(&entry.emoji) {
            return false;
        }
        if !self.agents.is_empty() && !self.agents.contains(&entry.agent) {
            return false;
        }
        if let Some(matcher) = &self.message {
            let text = match &entry.content {
                Some(content) => format!("{} {}", entry.message, content),
                None => entry.message.clone(),
            };
            if !matcher.matches(&text) && !matcher.matches(&entry.message) {
                return false;
            }
        }
        for (key, expected) in &self.meta_equals {
            if entry.meta.get(key) != Some(expected) {
                return false;
            }
        }
        if !self.priority.is_empty() {
            match entry.meta.get("priority") {
                Some(v) if self.priority.iter().any(|p| p.eq_ignore_ascii_case(v)) => {}
                _ => return false,
            }
        }
        if !self.category.is_empty() {
            match entry.meta.get("category") {
                Some(v) if self.category.iter().any(|c| c.eq_ignore_ascii_case(v)) => {}
                _ => return false,
            }
        }
        if let Some(min) = self.min_confidence {
            let confidence = entry
                .meta
                .get("confidence")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0);
            if confidence < min {
                return false;
            }
        }
        true
    }

    /// Push the SQL-expressible subset down into the mirror read.
    fn to_db_filters(&self, log_types: &[String]) -> EntryFilters {
        EntryFilters {
            agents: self.agents.clone(),
            emojis: self.emojis.clone(),
            log_types: log_types.to_vec(),
            message_substring: match &self.message {
                Some(MessageMatcher::Substring {
                    needle,
                    case_sensitive: false,
                }) => Some(needle.clone()),
                _ => None,
            },
            ts_start: self.start.map(encode_ts),
            ts_end: self.end.map(encode_ts),
            meta_equals: self.meta_equals.clone(),
            priority: self.priority.clone(),
            category: self.category.clone(),
            min_confidence: self.min_confidence,
        }
    }
}

// ---------------------------------------------------------------------------
// Relevance scoring
// ---------------------------------------------------------------------------

fn score_entry(entry: &QueryEntry, terms: &[String], phrase: &str, now: DateTime<Utc>) -> f64 {
    let text = match &entry.content {
        Some(content) => format!("{} {}", entry.message, content).to_lowercase(),
        None => entry.message.to_lowercase(),
    };
    let mut score = 0.0;
    if !terms.is_empty() {
        let hits = terms.iter().filter(|t| text.contains(t.as_str())).count();
        score += hits as f64 / terms.len() as f64;
    }
    if !phrase.is_empty() && text.contains(phrase) {
        score += 2.0;
    }
    let age_days = (now - entry.ts).num_seconds() as f64 / 86_400.0;
    if age_days <= 7.0 {
        score += 0.5;
    } else if age_days <= 30.0 {
        score += 0.25;
    }
    score
}

// ---------------------------------------------------------------------------
// Code-reference verification
// ---------------------------------------------------------------------------

fn code_reference_regex() -> Regex {
    Regex::new(r"[\w./-]+\.(py|ts|js|md|json|yaml|yml|sql|sh|bash|zsh)\b").expect("static regex")
}

fn verify_code_references(entry: &mut QueryEntry, repo_root: &Path, re: &Regex) {
    let mut broken: Vec<String> = Vec::new();
    let mut seen_any = false;
    for m in re.find_iter(&entry.message) {
        seen_any = true;
        let reference = m.as_str().trim_start_matches("./");
        let exists =
            repo_root.join(reference).exists() || PathBuf::from(m.as_str()).exists();
        if !exists {
            broken.push(m.as_str().to_string());
        }
    }
    if !seen_any {
        return;
    }
    if broken.is_empty() {
        entry
            .meta
            .insert("code_reference_verification".into(), "passed".into());
    } else {
        entry
            .meta
            .insert("code_reference_verification".into(), "failed".into());
        entry
            .meta
            .insert("broken_references".into(), broken.join(", "));
        entry.emoji = "⚠️".into();
    }
}

// ---------------------------------------------------------------------------
// Fetch paths
// ---------------------------------------------------------------------------

async fn fetch_from_mirror(
    app: &AppState,
    project_name: &str,
    filters: &CompiledFilters,
    log_types: &[String],
    cap: u64,
) -> ToolResult<Option<Vec<QueryEntry>>> {
    let Some(row) = app.db.get_project_row(project_name).await? else {
        return Ok(None);
    };
    if !app.db.has_entries(row.id).await? {
        return Ok(None);
    }

    let db_filters = filters.to_db_filters(log_types);
    let rows = app
        .db
        .fetch_recent_entries_paginated(row.id, 1, cap, &db_filters)
        .await?;
    let entries = rows
        .into_iter()
        .filter_map(|r| {
            let ts = decode_ts(&r.ts)?;
            let meta = r
                .meta_map()
                .into_iter()
                .map(|(k, v)| {
                    (
                        k,
                        match v {
                            Value::String(s) => s,
                            other => other.to_string(),
                        },
                    )
                })
                .collect();
            Some(QueryEntry {
                project: project_name.to_string(),
                ts,
                emoji: r.emoji,
                agent: r.agent,
                message: r.message,
                entry_id: Some(r.entry_id),
                log_type: r.log_type,
                meta,
                content: None,
                relevance: 0.0,
            })
        })
        .filter(|e| filters.matches(e))
        .collect();
    Ok(Some(entries))
}

/// Fallback: lazily stream the log file in reverse with the canonical
/// line parser, stopping once `cap` matches are found.
fn fetch_from_file(
    path: &Path,
    project_name: &str,
    log_type: &str,
    filters: &CompiledFilters,
    cap: u64,
) -> Vec<QueryEntry> {
    let Ok(reader) = ReverseLineReader::open(path) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in reader {
        let Ok(line) = line else { break };
        let Some(record) = parse_line(&line) else {
            continue;
        };
        let entry = QueryEntry {
            project: project_name.to_string(),
            ts: record.ts,
            emoji: record.emoji,
            agent: record.agent,
            message: record.message,
            entry_id: record.entry_id,
            log_type: log_type.to_string(),
            meta: record.meta.into_iter().collect(),
            content: None,
            relevance: 0.0,
        };
        if filters.matches(&entry) {
            out.push(entry);
            if out.len() as u64 >= cap {
                break;
            }
        }
    }
    out
}

/// Parse a Markdown document into synthetic section entries.
fn fetch_document_sections(
    path: &Path,
    project_name: &str,
    document_type: &str,
    filters: &CompiledFilters,
    now: DateTime<Utc>,
) -> Vec<QueryEntry> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut sections: Vec<(String, Vec<String>)> = Vec::new();
    for line in content.lines() {
        if line.trim_start().starts_with('#') {
            sections.push((line.trim().trim_start_matches('#').trim().to_string(), Vec::new()));
        } else if let Some((_, body)) = sections.last_mut() {
            body.push(line.to_string());
        }
    }
    sections
        .into_iter()
        .filter(|(heading, _)| !heading.is_empty())
        .map(|(heading, body)| {
            let mut meta = BTreeMap::new();
            meta.insert("document_type".into(), document_type.to_string());
            meta.insert("source_file".into(), path.display().to_string());
            QueryEntry {
                project: project_name.to_string(),
                ts: now,
                emoji: "📄".into(),
                agent: "DocumentParser".into(),
                message: heading,
                entry_id: None,
                log_type: document_type.to_string(),
                meta,
                content: Some(body.join("\n").trim().to_string()),
                relevance: 0.0,
            }
        })
        .filter(|e| filters.matches(e))
        .collect()
}

// ---------------------------------------------------------------------------
// The tool
// ---------------------------------------------------------------------------

pub async fn query_entries(app: &AppState, req: QueryRequest) -> ToolResult<ToolResponse> {
    let now = Utc::now();
    let filters = compile_filters(&req, now)?;
    let page = req.page.unwrap_or(1).max(1);
    let page_size = req.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let scope = req.scope.as_deref().unwrap_or("project").to_ascii_lowercase();

    // When relevance ordering can reshuffle results, a ts-bounded cap
    // would bias the page; fetch broadly in that case.
    let has_relevance = req.message.as_deref().map(|m| !m.trim().is_empty()).unwrap_or(false);
    let cap = if has_relevance || req.relevance_threshold.is_some() {
        10_000
    } else {
        page * page_size + 1
    };

    // Scope resolution.
    let mut project_names: Vec<String> = Vec::new();
    let mut include_global = false;
    let mut document_types: Vec<String> = req.document_types.clone().unwrap_or_default();
    match scope.as_str() {
        "project" => {
            let context = resolve_project(
                app,
                req.project.as_deref(),
                req.agent_id.as_deref(),
                req.session_id.as_deref(),
                true,
            )
            .await?
            .expect("require=true never yields None");
            project_names.push(context.name);
        }
        "all_projects" => {
            project_names = registered_projects_excluding_scratch(app).await?;
        }
        "global" => include_global = true,
        "research" | "bugs" | "all" => {
            project_names = registered_projects_excluding_scratch(app).await?;
            include_global = true;
            if document_types.is_empty() {
                document_types = match scope.as_str() {
                    "research" => vec!["research".into()],
                    "bugs" => vec!["bugs".into()],
                    _ => vec!["progress".into(), "research".into(), "architecture".into(), "bugs".into()],
                };
            }
        }
        other => {
            return Err(ToolError::InvalidParameter {
                field: "scope".into(),
                message: format!(
                    "unknown scope {other:?} (project, all_projects, global, research, bugs, all)"
                ),
            })
        }
    }

    let log_types: Vec<String> = document_types
        .iter()
        .filter(|d| matches!(d.as_str(), "progress" | "bugs"))
        .map(|d| d.to_string())
        .collect();

    // Per-project fetch: mirror first, file fallback.
    let mut entries: Vec<QueryEntry> = Vec::new();
    for name in &project_names {
        let fetched = fetch_from_mirror(app, name, &filters, &log_types, cap).await?;
        match fetched {
            Some(found) => entries.extend(found),
            None => {
                debug!(project = %name, "no mirror entries; falling back to file scan");
                let context = project_context(&app.settings, name);
                let targets: Vec<(&str, &str)> = if log_types.is_empty() {
                    vec![("progress", "progress_log")]
                } else {
                    log_types
                        .iter()
                        .map(|t| match t.as_str() {
                            "bugs" => ("bugs", "bug_log"),
                            _ => ("progress", "progress_log"),
                        })
                        .collect()
                };
                for (log_type, doc_key) in targets {
                    if let Some(path) = context.doc_path(doc_key) {
                        entries.extend(fetch_from_file(path, name, log_type, &filters, cap));
                    }
                }
            }
        }

        // Per-project document sections.
        if document_types.iter().any(|d| d == "architecture") {
            let context = project_context(&app.settings, name);
            if let Some(path) = context.doc_path("architecture") {
                entries.extend(fetch_document_sections(path, name, "architecture", &filters, now));
            }
        }
    }

    // Research docs are repo-level; scan the tree once.
    if document_types.iter().any(|d| d == "research") {
        let research_dir = app.settings.repo_root.join("docs/research");
        if research_dir.is_dir() {
            for doc in walkdir::WalkDir::new(&research_dir)
                .max_depth(2)
                .into_iter()
                .flatten()
                .filter(|e| e.path().extension().map(|x| x == "md").unwrap_or(false))
            {
                entries.extend(fetch_document_sections(doc.path(), "global", "research", &filters, now));
            }
        }
    }

    if include_global {
        let global_path = app.settings.global_progress_log();
        entries.extend(fetch_from_file(&global_path, "global", "progress", &filters, cap));
    }

    // Relevance scoring and ordering.
    let mut filtered = false;
    if has_relevance {
        let phrase = req.message.as_deref().unwrap_or_default().trim().to_lowercase();
        let terms: Vec<String> = phrase
            .split_whitespace()
            .map(|t| t.to_string())
            .collect();
        for entry in &mut entries {
            entry.relevance = score_entry(entry, &terms, &phrase, now);
        }
        if let Some(threshold) = req.relevance_threshold {
            let before = entries.len();
            entries.retain(|e| e.relevance >= threshold);
            filtered = before != entries.len();
        }
        entries.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.ts.cmp(&a.ts))
        });
    } else {
        entries.sort_by(|a, b| b.ts.cmp(&a.ts));
    }

    // Optional code-reference verification on the surviving set.
    if req.verify_code_references {
        let re = code_reference_regex();
        for entry in &mut entries {
            verify_code_references(entry, &app.settings.repo_root, &re);
        }
    }

    // Pagination over the merged set.
    let total_count = entries.len() as u64;
    let start_idx = ((page - 1) * page_size) as usize;
    let end_idx = (start_idx + page_size as usize).min(entries.len());
    let page_entries = if start_idx < entries.len() {
        &entries[start_idx..end_idx]
    } else {
        &[]
    };

    let include_metadata = req.include_metadata.unwrap_or(!req.compact);
    let rendered: Vec<Value> = page_entries
        .iter()
        .map(|e| render_entry(e, req.compact, include_metadata, req.fields.as_deref()))
        .collect();

    let mut projects_searched = project_names.clone();
    if include_global {
        projects_searched.push("global".into());
    }

    Ok(ToolResponse::ok()
        .field("entries", json!(rendered))
        .field(
            "pagination",
            json!({
                "page": page,
                "page_size": page_size,
                "total_count": total_count,
                "has_next": total_count > page * page_size,
                "has_prev": page > 1,
            }),
        )
        .field("search_scope", scope)
        .field("projects_searched", json!(projects_searched))
        .field("total_available", total_count)
        .field("filtered", filtered))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadRecentRequest {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub log_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Return raw lines instead of parsed records.
    #[serde(default)]
    pub raw: bool,
}

/// read_recent tool: the tail of one log, oldest-first, straight from the
/// file (no mirror round-trip).
pub async fn read_recent(app: &AppState, req: ReadRecentRequest) -> ToolResult<ToolResponse> {
    let context = resolve_project(
        app,
        req.project.as_deref(),
        req.agent_id.as_deref(),
        req.session_id.as_deref(),
        true,
    )
    .await?
    .expect("require=true never yields None");

    let config = app
        .settings
        .log_type(req.log_type.as_deref().unwrap_or("progress"));
    let path = context.dir.join(&config.file_name);
    let limit = req.limit.unwrap_or(10).clamp(1, 500);

    let lines = match scribe_core::tail::tail_lines(&path, limit).await {
        Ok(lines) => lines,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(ToolError::File(scribe_core::error::FileError::io(path, e)))
        }
    };

    let rendered: Vec<Value> = if req.raw {
        lines.iter().map(|l| json!(l)).collect()
    } else {
        lines
            .iter()
            .filter_map(|l| parse_line(l))
            .map(|r| {
                json!({
                    "ts": encode_ts(r.ts),
                    "emoji": r.emoji,
                    "agent": r.agent,
                    "message": r.message,
                    "id": r.entry_id,
                    "meta": r.meta.into_iter().collect::<BTreeMap<_, _>>(),
                })
            })
            .collect()
    };

    let count = rendered.len();
    Ok(ToolResponse::ok()
        .field("project", context.name)
        .field("log_type", config.name)
        .field("path", path.display().to_string())
        .field("entries", json!(rendered))
        .field("count", count as u64))
}

async fn registered_projects_excluding_scratch(app: &AppState) -> ToolResult<Vec<String>> {
    Ok(app
        .db
        .list_project_rows()
        .await?
        .into_iter()
        .map(|r| r.name)
        .filter(|name| {
            let lower = name.to_lowercase();
            !lower.starts_with("temp") && !lower.starts_with("test") && !lower.ends_with("-test")
        })
        .collect())
}

fn render_entry(
    entry: &QueryEntry,
    compact: bool,
    include_metadata: bool,
    fields: Option<&[String]>,
) -> Value {
    let mut full = Map::new();
    full.insert("ts".into(), json!(encode_ts(entry.ts)));
    full.insert("emoji".into(), json!(entry.emoji));
    full.insert("agent".into(), json!(entry.agent));
    full.insert("message".into(), json!(entry.message));
    full.insert("project_name".into(), json!(entry.project));
    full.insert("log_type".into(), json!(entry.log_type));
    if let Some(id) = &entry.entry_id {
        full.insert("id".into(), json!(id));
    }
    if entry.relevance > 0.0 {
        full.insert("relevance_score".into(), json!(entry.relevance));
    }
    if let Some(content) = &entry.content {
        full.insert("content".into(), json!(content));
    }
    if include_metadata && !entry.meta.is_empty() {
        full.insert("meta".into(), json!(entry.meta));
    }

    if let Some(fields) = fields {
        full.retain(|k, _| fields.iter().any(|f| f == k));
    }

    if !compact {
        return Value::Object(full);
    }

    // Compact aliases + message truncation.
    let aliases = [
        ("ts", "t"),
        ("emoji", "e"),
        ("agent", "a"),
        ("message", "m"),
        ("project_name", "p"),
        ("id", "i"),
        ("log_type", "l"),
        ("relevance_score", "r"),
        ("meta", "md"),
        ("content", "c"),
    ];
    let mut out = Map::new();
    for (long, short) in aliases {
        if let Some(mut value) = full.remove(long) {
            if long == "message" {
                if let Value::String(text) = &value {
                    if text.chars().count() > COMPACT_MESSAGE_LIMIT {
                        let truncated: String =
                            text.chars().take(COMPACT_MESSAGE_LIMIT).collect();
                        value = json!(format!("{truncated}…"));
                    }
                }
            }
            out.insert(short.into(), value);
        }
    }
    Value::Object(out)
}
