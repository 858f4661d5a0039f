// crates/server/src/docs.rs
// Document manager: section/range/patch edits with hash preconditions,
// document creation, crosslink validation, and the special report kinds.
// Actions dispatch through a closed table; every byte-modifying action
// runs under the file lock, writes atomically, and records a
// DocumentChange row plus registry hash updates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use scribe_core::atomic::{atomic_write, sibling_with_suffix};
use scribe_core::docs::{
    apply_structured_edit, apply_unified_patch, extract_links, generate_toc, list_checklist_items,
    list_sections, normalize_headers, replace_range, replace_section, EditOperation,
};
use scribe_core::entry::format_line_timestamp;
use scribe_core::error::{DocError, FileError};
use scribe_core::integrity::sha256_hex;
use scribe_core::lock::FileLock;
use scribe_core::slug::slugify;
use scribe_db::registry::CORE_DOCS;

use crate::error::{ToolError, ToolResult};
use crate::projects::{resolve_project, ProjectContext};
use crate::response::ToolResponse;
use crate::state::AppState;

const MUTATING_ACTIONS: [&str; 8] = [
    "replace_section",
    "replace_range",
    "replace_text",
    "append",
    "apply_patch",
    "status_update",
    "normalize_headers",
    "generate_toc",
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManageDocsRequest {
    pub action: String,
    #[serde(default)]
    pub doc: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Section anchor for section-addressed actions.
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub start_line: Option<usize>,
    #[serde(default)]
    pub end_line: Option<usize>,
    #[serde(default)]
    pub find: Option<String>,
    #[serde(default)]
    pub replace: Option<String>,
    #[serde(default)]
    pub patch: Option<String>,
    /// `structured` or `unified`.
    #[serde(default)]
    pub patch_mode: Option<String>,
    /// Pre-image SHA-256 required for unified patches.
    #[serde(default)]
    pub patch_source_hash: Option<String>,
    /// Structured mode payload: `{"operations": [...]}`.
    #[serde(default)]
    pub edit: Option<Value>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub doc_name: Option<String>,
    #[serde(default)]
    pub target_dir: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

impl ManageDocsRequest {
    fn meta_obj(&self) -> serde_json::Map<String, Value> {
        self.metadata
            .as_ref()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }

    fn meta_str(&self, key: &str) -> Option<String> {
        self.meta_obj()
            .get(key)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .filter(|s| !s.trim().is_empty())
    }
}

/// manage_docs tool entry point: closed dispatch table over actions.
pub fn manage_docs<'a>(
    app: &'a AppState,
    req: ManageDocsRequest,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ToolResult<ToolResponse>> + Send + 'a>> {
    Box::pin(async move {
        let context = resolve_project(
            app,
            req.project.as_deref(),
            req.agent_id.as_deref(),
            req.session_id.as_deref(),
            true,
        )
        .await?
        .expect("require=true never yields None");

        let action = req.action.trim().to_ascii_lowercase();
        match action.as_str() {
            "list_sections" => list_sections_action(&context, &req),
            "list_checklist_items" => list_checklist_action(&context, &req),
            "search" => search_action(&context, &req),
            "validate_crosslinks" => validate_crosslinks_action(&context, &req),
            "create_doc" => create_doc_action(app, &context, &req).await,
            "batch" => batch_action(app, &context, &req).await,
            "create_research_doc" | "create_bug_report" | "create_review_report"
            | "create_agent_report_card" => {
                special_doc_action(app, &context, &req, &action).await
            }
            _ if MUTATING_ACTIONS.contains(&action.as_str()) => {
                mutate_action(app, &context, &req, &action).await
            }
            other => Err(ToolError::InvalidParameter {
                field: "action".into(),
                message: format!(
                    "unknown action {other:?}; allowed: {}, list_sections, list_checklist_items, \
                     search, validate_crosslinks, create_doc, batch, create_research_doc, \
                     create_bug_report, create_review_report, create_agent_report_card",
                    MUTATING_ACTIONS.join(", ")
                ),
            }),
        }
    })
}

/// Resolve a registered doc key to its path.
fn doc_path(context: &ProjectContext, doc: Option<&str>) -> ToolResult<(String, PathBuf)> {
    let key = doc.unwrap_or_default().trim().to_string();
    if key.is_empty() {
        return Err(ToolError::InvalidParameter {
            field: "doc".into(),
            message: "doc key is required for this action".into(),
        });
    }
    match context.doc_path(&key) {
        Some(path) => Ok((key, path.clone())),
        None => Err(ToolError::Doc(DocError::DocNotRegistered { doc: key })),
    }
}

fn read_doc(path: &Path) -> ToolResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| ToolError::File(FileError::io(path.to_path_buf(), e)))
}

// ---------------------------------------------------------------------------
// Read-only actions
// ---------------------------------------------------------------------------

fn list_sections_action(context: &ProjectContext, req: &ManageDocsRequest) -> ToolResult<ToolResponse> {
    let (key, path) = doc_path(context, req.doc.as_deref())?;
    let content = read_doc(&path)?;
    let (sections, duplicates) = list_sections(&content);

    let mut response = ToolResponse::ok()
        .field("doc", key)
        .field("path", path.display().to_string())
        .field(
            "sections",
            json!(sections
                .iter()
                .map(|s| json!({
                    "anchor": s.anchor,
                    "line": s.line,
                    "heading": s.heading,
                }))
                .collect::<Vec<_>>()),
        );
    for (anchor, lines) in duplicates {
        response.warn(
            "DuplicateAnchor",
            format!("anchor '{anchor}' appears at lines {lines:?}"),
        );
    }
    Ok(response)
}

fn list_checklist_action(context: &ProjectContext, req: &ManageDocsRequest) -> ToolResult<ToolResponse> {
    let (key, path) = doc_path(context, req.doc.as_deref())?;
    let content = read_doc(&path)?;
    let items = list_checklist_items(&content);
    let open = items.iter().filter(|i| !i.checked).count();
    let done = items.len() - open;

    Ok(ToolResponse::ok()
        .field("doc", key)
        .field(
            "items",
            json!(items
                .iter()
                .map(|i| json!({"line": i.line, "checked": i.checked, "text": i.text}))
                .collect::<Vec<_>>()),
        )
        .field("open", open as u64)
        .field("done", done as u64))
}

fn search_action(context: &ProjectContext, req: &ManageDocsRequest) -> ToolResult<ToolResponse> {
    let query = req
        .meta_str("query")
        .or_else(|| req.meta_str("search"))
        .ok_or_else(|| ToolError::InvalidParameter {
            field: "metadata.query".into(),
            message: "search requires metadata.query".into(),
        })?;
    let needle = query.to_lowercase();

    let mut matches: Vec<Value> = Vec::new();
    for (key, path) in &context.docs {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            if line.to_lowercase().contains(&needle) {
                matches.push(json!({
                    "doc": key,
                    "line": idx + 1,
                    "text": line.trim(),
                }));
            }
        }
    }
    let total = matches.len();
    Ok(ToolResponse::ok()
        .field("query", query)
        .field("matches", json!(matches))
        .field("total", total as u64))
}

fn validate_crosslinks_action(
    context: &ProjectContext,
    req: &ManageDocsRequest,
) -> ToolResult<ToolResponse> {
    let targets: Vec<(String, PathBuf)> = match req.doc.as_deref() {
        Some(doc) if !doc.trim().is_empty() => vec![doc_path(context, Some(doc))?],
        _ => context
            .docs
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect(),
    };

    let mut broken: Vec<Value> = Vec::new();
    let mut checked = 0u64;
    for (key, path) in targets {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let base = path.parent().unwrap_or(&context.root).to_path_buf();
        for link in extract_links(&content) {
            checked += 1;
            let resolved = base.join(&link.target);
            let from_root = context.root.join(&link.target);
            if !resolved.exists() && !from_root.exists() {
                broken.push(json!({
                    "doc": key,
                    "line": link.line,
                    "text": link.text,
                    "target": link.target,
                }));
            }
        }
    }
    let ok_links = checked - broken.len() as u64;
    Ok(ToolResponse::ok()
        .field("checked", checked)
        .field("valid", ok_links)
        .field("broken_links", json!(broken)))
}

// ---------------------------------------------------------------------------
// Mutating actions
// ---------------------------------------------------------------------------

async fn mutate_action(
    app: &AppState,
    context: &ProjectContext,
    req: &ManageDocsRequest,
    action: &str,
) -> ToolResult<ToolResponse> {
    let (key, path) = doc_path(context, req.doc.as_deref())?;
    let before = read_doc(&path)?;
    let sha_before = sha256_hex(before.as_bytes());

    let after = compute_mutation(app, req, action, &before, &sha_before)?;
    let sha_after = sha256_hex(after.as_bytes());
    let diff = scribe_core::docs::patch::render_unified_diff(&before, &after, &key);

    let mut response = ToolResponse::ok()
        .field("doc", key.clone())
        .field("action", action.to_string())
        .field("path", path.display().to_string())
        .field("sha_before", sha_before.clone())
        .field("sha_after", sha_after.clone())
        .field("dry_run", req.dry_run)
        .field("diff", diff);

    let (_, duplicates) = list_sections(&after);
    for (anchor, lines) in duplicates {
        response.warn(
            "DuplicateAnchor",
            format!("anchor '{anchor}' appears at lines {lines:?}"),
        );
    }

    if req.dry_run {
        return Ok(response);
    }

    {
        let _lock = FileLock::acquire(&path).await?;
        // Hash again under the lock: a concurrent edit between read and
        // lock acquisition invalidates the computed change.
        let current = read_doc(&path)?;
        if sha256_hex(current.as_bytes()) != sha_before {
            return Err(ToolError::Doc(DocError::PatchHashMismatch {
                expected: sha_before,
                actual: sha256_hex(current.as_bytes()),
            }));
        }
        atomic_write(&path, &after).await?;
    }

    record_change(app, context, req, &key, &path, action, Some(&sha_before), &sha_after).await;

    // Phase-plan status markers also land in the phases table so the
    // registry view can report plan progress without parsing Markdown.
    if action == "status_update" && key == "phase_plan" {
        if let (Some(anchor), Some(status)) = (req.section.as_deref(), req.meta_str("status")) {
            if let Ok(Some(row)) = app.db.get_project_row(&context.name).await {
                let (sections, _) = list_sections(&after);
                let position = sections
                    .iter()
                    .position(|s| s.anchor == anchor)
                    .unwrap_or(0) as i64;
                if let Err(e) = app.db.upsert_phase(row.id, anchor, &status, position).await {
                    warn!(error = %e, "phase upsert failed");
                }
            }
        }
    }

    info!(project = %context.name, doc = %key, action, "document updated");
    Ok(response)
}

fn compute_mutation(
    _app: &AppState,
    req: &ManageDocsRequest,
    action: &str,
    before: &str,
    sha_before: &str,
) -> ToolResult<String> {
    match action {
        "replace_section" => {
            let anchor = req.section.as_deref().ok_or_else(|| ToolError::InvalidParameter {
                field: "section".into(),
                message: "replace_section requires a section anchor".into(),
            })?;
            let content = req.content.as_deref().unwrap_or_default();
            Ok(replace_section(before, anchor, content)?)
        }
        "replace_range" => {
            let (start, end) = match (req.start_line, req.end_line) {
                (Some(s), Some(e)) => (s, e),
                _ => {
                    return Err(ToolError::InvalidParameter {
                        field: "start_line".into(),
                        message: "replace_range requires start_line and end_line".into(),
                    })
                }
            };
            let content = req.content.as_deref().unwrap_or_default();
            Ok(replace_range(before, start, end, content)?)
        }
        "replace_text" => {
            let find = req.find.as_deref().filter(|f| !f.is_empty()).ok_or_else(|| {
                ToolError::InvalidParameter {
                    field: "find".into(),
                    message: "replace_text requires find".into(),
                }
            })?;
            if !before.contains(find) {
                return Err(ToolError::Doc(DocError::MalformedPatch {
                    message: format!("replace_text target not found: {find:?}"),
                }));
            }
            Ok(before.replace(find, req.replace.as_deref().unwrap_or_default()))
        }
        "append" => {
            let content = req.content.as_deref().ok_or_else(|| ToolError::InvalidParameter {
                field: "content".into(),
                message: "append requires content".into(),
            })?;
            let mut after = before.to_string();
            if !after.is_empty() && !after.ends_with('\n') {
                after.push('\n');
            }
            after.push_str(content);
            if !after.ends_with('\n') {
                after.push('\n');
            }
            Ok(after)
        }
        "apply_patch" => apply_patch_mutation(req, before, sha_before),
        "status_update" => status_update_mutation(req, before),
        "normalize_headers" => Ok(normalize_headers(before)),
        "generate_toc" => generate_toc_mutation(before),
        other => Err(ToolError::InvalidParameter {
            field: "action".into(),
            message: format!("unhandled mutating action {other:?}"),
        }),
    }
}

fn apply_patch_mutation(
    req: &ManageDocsRequest,
    before: &str,
    sha_before: &str,
) -> ToolResult<String> {
    match req.patch_mode.as_deref().unwrap_or("unified") {
        "structured" => {
            let operations = req
                .edit
                .as_ref()
                .and_then(|e| e.get("operations"))
                .cloned()
                .ok_or_else(|| ToolError::InvalidParameter {
                    field: "edit".into(),
                    message: "structured mode requires edit.operations".into(),
                })?;
            let operations: Vec<EditOperation> =
                serde_json::from_value(operations).map_err(|e| ToolError::InvalidParameter {
                    field: "edit.operations".into(),
                    message: format!("unparseable operations: {e}"),
                })?;
            Ok(apply_structured_edit(before, &operations)?)
        }
        "unified" => {
            let patch = req.patch.as_deref().ok_or_else(|| ToolError::InvalidParameter {
                field: "patch".into(),
                message: "unified mode requires a patch body".into(),
            })?;
            let expected = req.patch_source_hash.as_deref().ok_or_else(|| {
                ToolError::InvalidParameter {
                    field: "patch_source_hash".into(),
                    message: "unified mode requires patch_source_hash (pre-image SHA-256)".into(),
                }
            })?;
            if !expected.eq_ignore_ascii_case(sha_before) {
                return Err(ToolError::Doc(DocError::PatchHashMismatch {
                    expected: expected.to_string(),
                    actual: sha_before.to_string(),
                }));
            }
            Ok(apply_unified_patch(before, patch)?)
        }
        other => Err(ToolError::InvalidParameter {
            field: "patch_mode".into(),
            message: format!("unknown patch_mode {other:?} (structured, unified)"),
        }),
    }
}

/// Rewrite (or add) the `- Status:` marker inside a section.
fn status_update_mutation(req: &ManageDocsRequest, before: &str) -> ToolResult<String> {
    let anchor = req.section.as_deref().ok_or_else(|| ToolError::InvalidParameter {
        field: "section".into(),
        message: "status_update requires a section anchor".into(),
    })?;
    let status = req.meta_str("status").ok_or_else(|| ToolError::InvalidParameter {
        field: "metadata.status".into(),
        message: "status_update requires metadata.status".into(),
    })?;

    let timestamp = format_line_timestamp(Utc::now());
    let marker = match req.meta_str("proof") {
        Some(proof) => format!("- Status: {status} ({timestamp}, proof: {proof})"),
        None => format!("- Status: {status} ({timestamp})"),
    };

    let (sections, _) = list_sections(before);
    let target = sections
        .iter()
        .find(|s| s.anchor == anchor)
        .ok_or_else(|| DocError::SectionNotFound {
            anchor: anchor.to_string(),
        })?;
    let lines: Vec<&str> = before.lines().collect();
    let body_start = target.line;
    let body_end = sections
        .iter()
        .find(|s| s.line > target.line)
        .map(|s| s.line - 1)
        .unwrap_or(lines.len());

    let mut out: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
    let existing = (body_start..body_end).find(|i| {
        out.get(*i)
            .map(|l| l.trim_start().starts_with("- Status:"))
            .unwrap_or(false)
    });
    match existing {
        Some(i) => out[i] = marker,
        None => out.insert(body_end, marker),
    }

    let mut result = out.join("\n");
    if before.ends_with('\n') {
        result.push('\n');
    }
    Ok(result)
}

/// Write the generated TOC into a `<!-- ID: toc -->` section, or insert
/// one after the document title.
fn generate_toc_mutation(before: &str) -> ToolResult<String> {
    let toc = generate_toc(before);
    let block = format!("## Table of Contents\n\n{toc}");
    let (sections, _) = list_sections(before);
    if sections.iter().any(|s| s.anchor == "toc") {
        return Ok(replace_section(before, "toc", &block)?);
    }

    let mut out: Vec<String> = Vec::new();
    let mut inserted = false;
    for line in before.lines() {
        out.push(line.to_string());
        if !inserted && line.starts_with("# ") {
            out.push(String::new());
            out.push("<!-- ID: toc -->".to_string());
            out.push(block.trim_end().to_string());
            inserted = true;
        }
    }
    if !inserted {
        out.insert(0, block.trim_end().to_string());
        out.insert(0, "<!-- ID: toc -->".to_string());
    }
    let mut result = out.join("\n");
    if before.ends_with('\n') {
        result.push('\n');
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// create_doc / batch
// ---------------------------------------------------------------------------

async fn create_doc_action(
    app: &AppState,
    context: &ProjectContext,
    req: &ManageDocsRequest,
) -> ToolResult<ToolResponse> {
    let meta = req.meta_obj();
    let register_existing = meta
        .get("register_existing")
        .map(value_truthy)
        .unwrap_or(false);

    let file_name = req
        .doc_name
        .clone()
        .or_else(|| req.meta_str("doc_name"))
        .or_else(|| req.doc.clone())
        .ok_or_else(|| ToolError::InvalidParameter {
            field: "doc_name".into(),
            message: "create_doc requires doc_name (or doc)".into(),
        })?;
    let file_name = if file_name.ends_with(".md") {
        file_name
    } else {
        format!("{file_name}.md")
    };

    let target_dir = match req.target_dir.as_deref() {
        Some(dir) if !dir.trim().is_empty() => {
            scribe_core::sandbox::resolve_in_sandbox(&context.root, Path::new(dir))?
        }
        _ => context.dir.clone(),
    };
    let path = scribe_core::sandbox::resolve_in_sandbox(&context.root, &target_dir.join(&file_name))?;

    let register_key = req
        .meta_str("register_as")
        .unwrap_or_else(|| slugify(file_name.trim_end_matches(".md"), "doc"));

    if register_existing {
        if !path.exists() {
            return Err(ToolError::File(FileError::NotFound { path }));
        }
        // Bytes untouched; just register the mapping.
        register_doc(app, context, &register_key, &path).await;
        return Ok(ToolResponse::ok()
            .field("doc", register_key)
            .field("path", path.display().to_string())
            .field("registered", true)
            .field("created", false));
    }

    if path.exists() {
        return Err(ToolError::InvalidParameter {
            field: "doc_name".into(),
            message: format!(
                "{} already exists (use register_existing to adopt it)",
                path.display()
            ),
        });
    }

    let content = req
        .content
        .clone()
        .unwrap_or_else(|| format!("# {}\n\n", file_name.trim_end_matches(".md")));
    if req.dry_run {
        return Ok(ToolResponse::ok()
            .field("doc", register_key)
            .field("path", path.display().to_string())
            .field("dry_run", true)
            .field("created", false));
    }

    atomic_write(&path, &content).await?;
    let sha_after = sha256_hex(content.as_bytes());

    // Paths under the project's docs dir register by default.
    let inside_docs_dir = path.starts_with(&context.dir);
    if inside_docs_dir {
        register_doc(app, context, &register_key, &path).await;
    }
    record_change(app, context, req, &register_key, &path, "create_doc", None, &sha_after).await;

    Ok(ToolResponse::ok()
        .field("doc", register_key)
        .field("path", path.display().to_string())
        .field("created", true)
        .field("registered", inside_docs_dir)
        .field("sha_after", sha_after))
}

fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        _ => false,
    }
}

async fn register_doc(app: &AppState, context: &ProjectContext, key: &str, path: &Path) {
    if let Ok(Some(row)) = app.db.get_project_row(&context.name).await {
        let mut meta = row.meta_value();
        let root = meta.as_object_mut().expect("meta root is an object");
        let docs = root.entry("docs_paths").or_insert_with(|| json!({}));
        if let Some(map) = docs.as_object_mut() {
            map.insert(key.to_string(), json!(path.display().to_string()));
        }
        if let Err(e) = app.db.update_project_meta(&context.name, &meta.to_string()).await {
            warn!(error = %e, "doc registration failed");
        }
    }
}

async fn batch_action(
    app: &AppState,
    context: &ProjectContext,
    req: &ManageDocsRequest,
) -> ToolResult<ToolResponse> {
    let operations = req
        .meta_obj()
        .get("operations")
        .and_then(|v| v.as_array().cloned())
        .ok_or_else(|| ToolError::InvalidParameter {
            field: "metadata.operations".into(),
            message: "batch requires metadata.operations (array of manage_docs requests)".into(),
        })?;

    let mut results: Vec<Value> = Vec::new();
    let mut succeeded = 0u64;
    for (index, op) in operations.iter().enumerate() {
        let mut sub: ManageDocsRequest = match serde_json::from_value(op.clone()) {
            Ok(sub) => sub,
            Err(e) => {
                results.push(json!({
                    "index": index,
                    "ok": false,
                    "error": { "code": "InvalidParameter", "message": e.to_string() },
                }));
                continue;
            }
        };
        sub.project = Some(context.name.clone());
        // Box (and type-erase) the recursion: batch -> manage_docs -> batch
        // would otherwise make the future type infinitely sized.
        let recursive: std::pin::Pin<
            Box<dyn std::future::Future<Output = ToolResult<ToolResponse>> + Send + '_>,
        > = Box::pin(manage_docs(app, sub));
        let outcome = recursive.await;
        match outcome {
            Ok(response) => {
                succeeded += 1;
                results.push(json!({ "index": index, "ok": true, "result": response.into_value() }));
            }
            Err(e) => results.push(json!({
                "index": index,
                "ok": false,
                "error": { "code": e.code(), "message": e.to_string() },
            })),
        }
    }
    let total = results.len() as u64;
    Ok(ToolResponse::ok()
        .field("results", json!(results))
        .field("succeeded", succeeded)
        .field("failed", total - succeeded))
}

// ---------------------------------------------------------------------------
// Special documents
// ---------------------------------------------------------------------------

async fn special_doc_action(
    app: &AppState,
    context: &ProjectContext,
    req: &ManageDocsRequest,
    action: &str,
) -> ToolResult<ToolResponse> {
    let title = req
        .doc_name
        .clone()
        .or_else(|| req.meta_str("title"))
        .ok_or_else(|| ToolError::InvalidParameter {
            field: "doc_name".into(),
            message: format!("{action} requires doc_name (used as the title)"),
        })?;
    let slug = slugify(&title, "untitled");
    let date = Utc::now().format("%Y-%m-%d").to_string();
    let meta = req.meta_obj();

    let (template, relative): (&str, PathBuf) = match action {
        "create_research_doc" => (
            "research_doc",
            PathBuf::from(format!("docs/research/{slug}.md")),
        ),
        "create_bug_report" => {
            let category = req
                .meta_str("category")
                .map(|c| slugify(&c, "general"))
                .unwrap_or_else(|| "general".into());
            (
                "bug_report",
                PathBuf::from(format!("docs/bugs/{category}/{date}_{slug}/report.md")),
            )
        }
        "create_review_report" => (
            "review_report",
            PathBuf::from(format!("docs/reviews/{date}_{slug}.md")),
        ),
        _ => (
            "agent_report_card",
            PathBuf::from(format!("docs/agents/{slug}/REPORT_CARD.md")),
        ),
    };
    let path = scribe_core::sandbox::resolve_in_sandbox(&context.root, &relative)?;

    let mut substitutions: BTreeMap<String, String> = meta
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
        .collect();
    substitutions.insert("title".into(), title.clone());
    substitutions.insert("timestamp".into(), format_line_timestamp(Utc::now()));
    substitutions.entry("summary".into()).or_insert_with(|| {
        req.content.clone().unwrap_or_default()
    });

    let body = app
        .templates
        .render(template, &substitutions)
        .unwrap_or_else(|| format!("# {title}\n\n"));

    if req.dry_run {
        return Ok(ToolResponse::ok()
            .field("path", path.display().to_string())
            .field("dry_run", true)
            .field("created", false));
    }

    atomic_write(&path, &body).await?;
    let sha_after = sha256_hex(body.as_bytes());

    // Refresh the sibling index; a corrupt index is backed up and rebuilt.
    let index_root = match action {
        "create_bug_report" => context.root.join("docs/bugs"),
        "create_review_report" => context.root.join("docs/reviews"),
        "create_agent_report_card" => context.root.join("docs/agents"),
        _ => context.root.join("docs/research"),
    };
    let mut response = ToolResponse::ok()
        .field("path", path.display().to_string())
        .field("created", true)
        .field("sha_after", sha_after.clone());
    if let Err(e) = regenerate_index(&index_root, &index_title(action)).await {
        response.warn("IndexUpdateFailure", e.to_string());
    }

    record_change(app, context, req, &slug, &path, action, None, &sha_after).await;
    Ok(response)
}

fn index_title(action: &str) -> String {
    match action {
        "create_bug_report" => "Bug Reports".into(),
        "create_review_report" => "Review Reports".into(),
        "create_agent_report_card" => "Agent Report Cards".into(),
        _ => "Research Index".into(),
    }
}

/// Rebuild `INDEX.md` from the directory listing, newest first. The index
/// is always regenerated from disk, so a corrupt one (anything not
/// starting with a heading) is backed up and then overwritten.
async fn regenerate_index(dir: &Path, title: &str) -> ToolResult<()> {
    let index_path = dir.join("INDEX.md");
    if let Ok(existing) = std::fs::read_to_string(&index_path) {
        if !existing.trim_start().starts_with('#') {
            let backup = sibling_with_suffix(&index_path, ".corrupt.bak");
            let _ = std::fs::copy(&index_path, &backup);
            warn!(index = %index_path.display(), "corrupt index backed up and regenerated");
        }
    }

    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(3).into_iter().flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "md").unwrap_or(false)
            && path.file_name().map(|n| n != "INDEX.md").unwrap_or(false)
        {
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            entries.push((mtime, path.to_path_buf()));
        }
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut body = format!("# {title}\n\n");
    for (_, path) in &entries {
        let rel = path.strip_prefix(dir).unwrap_or(path);
        let label = rel
            .with_extension("")
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, " / ");
        body.push_str(&format!("- [{label}]({})\n", rel.display()));
    }
    atomic_write(&index_path, &body).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Change recording
// ---------------------------------------------------------------------------

async fn record_change(
    app: &AppState,
    context: &ProjectContext,
    req: &ManageDocsRequest,
    doc_key: &str,
    path: &Path,
    action: &str,
    sha_before: Option<&str>,
    sha_after: &str,
) {
    let agent = req.agent.clone().unwrap_or_else(|| "Scribe".into());
    if let Ok(Some(row)) = app.db.get_project_row(&context.name).await {
        if let Err(e) = app
            .db
            .insert_doc_change(
                row.id,
                doc_key,
                req.section.as_deref(),
                action,
                &agent,
                &req.metadata.clone().unwrap_or_else(|| json!({})).to_string(),
                sha_before,
                Some(sha_after),
            )
            .await
        {
            warn!(error = %e, "doc change audit insert failed");
        }
    }
    // Registry hash/drift bookkeeping only tracks the well-known doc keys.
    if CORE_DOCS.contains(&doc_key) || context.docs.contains_key(doc_key) {
        if let Err(e) = app
            .registry
            .record_doc_update(&context.name, doc_key, &path.display().to_string(), sha_after)
            .await
        {
            warn!(error = %e, "registry doc update failed");
        }
    }
    app.events
        .doc_changed(&context.name, doc_key, action, Some(sha_after));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scribe_core::config::Settings;
    use scribe_core::state::StateManager;
    use scribe_db::Database;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn app_with_project(dir: &Path) -> (AppState, ProjectContext) {
        let settings = Settings::defaults(dir);
        let db = Database::new_in_memory().await.unwrap();
        let state = Arc::new(StateManager::in_memory(dir));
        let app = AppState::new(settings, db, state);
        crate::projects::set_project(
            &app,
            crate::projects::SetProjectRequest {
                name: "demo".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let context = crate::projects::project_context(&app.settings, "demo");
        (app, context)
    }

    fn write_doc(context: &ProjectContext, key: &str, content: &str) -> PathBuf {
        let path = context.doc_path(key).unwrap().clone();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    const ARCH: &str = "\
# Architecture Guide

<!-- ID: overview -->
## Overview

Original overview.

<!-- ID: decisions -->
## Decisions

None.
";

    #[tokio::test]
    async fn replace_section_writes_and_records() {
        let dir = tempdir().unwrap();
        let (app, context) = app_with_project(dir.path()).await;
        let path = write_doc(&context, "architecture", ARCH);

        let response = manage_docs(
            &app,
            ManageDocsRequest {
                action: "replace_section".into(),
                doc: Some("architecture".into()),
                section: Some("overview".into()),
                content: Some("## Overview\n\nRewritten.\n".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_value();

        assert_eq!(response["ok"], json!(true));
        let updated = std::fs::read_to_string(&path).unwrap();
        assert!(updated.contains("Rewritten."));
        assert!(!updated.contains("Original overview."));

        // Audit row + registry hashes recorded.
        let row = app.db.get_project_row("demo").await.unwrap().unwrap();
        let changes = app.db.list_doc_changes(row.id, 10).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, "replace_section");
        let view = app.registry.get_project("demo").await.unwrap().unwrap();
        assert!(view.docs.current_hashes.contains_key("architecture"));
    }

    #[tokio::test]
    async fn dry_run_never_mutates_and_diff_reapplies() {
        let dir = tempdir().unwrap();
        let (app, context) = app_with_project(dir.path()).await;
        let path = write_doc(&context, "architecture", ARCH);

        let dry = manage_docs(
            &app,
            ManageDocsRequest {
                action: "replace_section".into(),
                doc: Some("architecture".into()),
                section: Some("overview".into()),
                content: Some("## Overview\n\nRewritten.\n".into()),
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_value();

        // File untouched.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), ARCH);
        let projected_sha = dry["sha_after"].as_str().unwrap().to_string();

        // Applying the returned diff as a unified patch yields the same hash.
        let patch = dry["diff"].as_str().unwrap().to_string();
        let applied = manage_docs(
            &app,
            ManageDocsRequest {
                action: "apply_patch".into(),
                doc: Some("architecture".into()),
                patch_mode: Some("unified".into()),
                patch: Some(patch),
                patch_source_hash: Some(sha256_hex(ARCH.as_bytes())),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_value();
        assert_eq!(applied["sha_after"].as_str().unwrap(), projected_sha);
    }

    #[tokio::test]
    async fn stale_patch_hash_is_rejected_and_file_unchanged() {
        let dir = tempdir().unwrap();
        let (app, context) = app_with_project(dir.path()).await;
        let path = write_doc(&context, "architecture", ARCH);

        let err = manage_docs(
            &app,
            ManageDocsRequest {
                action: "apply_patch".into(),
                doc: Some("architecture".into()),
                patch_mode: Some("unified".into()),
                patch: Some("@@ -1,1 +1,1 @@\n-# Architecture Guide\n+# Changed\n".into()),
                patch_source_hash: Some("sha1ofstale".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "PatchHashMismatch");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), ARCH);
    }

    #[tokio::test]
    async fn unknown_doc_key_is_not_registered() {
        let dir = tempdir().unwrap();
        let (app, _context) = app_with_project(dir.path()).await;
        let err = manage_docs(
            &app,
            ManageDocsRequest {
                action: "list_sections".into(),
                doc: Some("nonexistent".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "DocNotRegistered");
    }

    #[tokio::test]
    async fn status_update_rewrites_marker() {
        let dir = tempdir().unwrap();
        let (app, context) = app_with_project(dir.path()).await;
        let checklist = "\
# Checklist

<!-- ID: phase_0 -->
## Phase 0

- [x] scaffold
- Status: open (2026-01-01 00:00:00 UTC)

<!-- ID: phase_1 -->
## Phase 1

- [ ] build
";
        let path = write_doc(&context, "checklist", checklist);

        manage_docs(
            &app,
            ManageDocsRequest {
                action: "status_update".into(),
                doc: Some("checklist".into()),
                section: Some("phase_0".into()),
                metadata: Some(json!({"status": "done", "proof": "commit_123"})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let updated = std::fs::read_to_string(&path).unwrap();
        assert!(updated.contains("- Status: done ("));
        assert!(updated.contains("proof: commit_123"));
        assert!(!updated.contains("- Status: open"));
        // Phase 1 untouched.
        assert!(updated.contains("- [ ] build"));
    }

    #[tokio::test]
    async fn phase_plan_status_update_records_phase_row() {
        let dir = tempdir().unwrap();
        let (app, context) = app_with_project(dir.path()).await;
        write_doc(
            &context,
            "phase_plan",
            "# Phase Plan\n\n<!-- ID: phase_0 -->\n## Phase 0\n\nScaffold.\n\n<!-- ID: phase_1 -->\n## Phase 1\n\nBuild.\n",
        );

        manage_docs(
            &app,
            ManageDocsRequest {
                action: "status_update".into(),
                doc: Some("phase_plan".into()),
                section: Some("phase_1".into()),
                metadata: Some(json!({"status": "in_progress"})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let row = app.db.get_project_row("demo").await.unwrap().unwrap();
        let phases = app.db.list_phases(row.id).await.unwrap();
        assert_eq!(
            phases,
            vec![("phase_1".to_string(), "in_progress".to_string(), 1)]
        );
        let view = app.registry.get_project("demo").await.unwrap().unwrap();
        assert_eq!(view.phases.len(), 1);
    }

    #[tokio::test]
    async fn create_doc_registers_under_docs_dir() {
        let dir = tempdir().unwrap();
        let (app, context) = app_with_project(dir.path()).await;
        std::fs::create_dir_all(&context.dir).unwrap();

        let response = manage_docs(
            &app,
            ManageDocsRequest {
                action: "create_doc".into(),
                doc_name: Some("NOTES".into()),
                content: Some("# Notes\n\nFirst note.\n".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_value();

        assert_eq!(response["created"], json!(true));
        assert_eq!(response["registered"], json!(true));
        let path = PathBuf::from(response["path"].as_str().unwrap());
        assert!(path.exists());

        let row = app.db.get_project_row("demo").await.unwrap().unwrap();
        let meta = row.meta_value();
        assert!(meta["docs_paths"]["notes"].as_str().unwrap().ends_with("NOTES.md"));
    }

    #[tokio::test]
    async fn create_doc_register_existing_is_byte_noop() {
        let dir = tempdir().unwrap();
        let (app, context) = app_with_project(dir.path()).await;
        std::fs::create_dir_all(&context.dir).unwrap();
        let existing = context.dir.join("LEGACY.md");
        std::fs::write(&existing, "# Legacy\n").unwrap();

        let response = manage_docs(
            &app,
            ManageDocsRequest {
                action: "create_doc".into(),
                doc_name: Some("LEGACY".into()),
                metadata: Some(json!({"register_existing": true, "register_as": "legacy"})),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_value();

        assert_eq!(response["registered"], json!(true));
        assert_eq!(response["created"], json!(false));
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "# Legacy\n");
    }

    #[tokio::test]
    async fn research_doc_creates_file_and_index() {
        let dir = tempdir().unwrap();
        let (app, _context) = app_with_project(dir.path()).await;

        let response = manage_docs(
            &app,
            ManageDocsRequest {
                action: "create_research_doc".into(),
                doc_name: Some("Queue Backpressure Study".into()),
                content: Some("Why the queue stalls.".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_value();

        let path = PathBuf::from(response["path"].as_str().unwrap());
        assert!(path.ends_with("docs/research/queue-backpressure-study.md"));
        assert!(path.exists());
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("# Queue Backpressure Study"));
        assert!(body.contains("Why the queue stalls."));

        let index = dir.path().join("docs/research/INDEX.md");
        let index_body = std::fs::read_to_string(&index).unwrap();
        assert!(index_body.starts_with("# Research Index"));
        assert!(index_body.contains("queue-backpressure-study"));
    }

    #[tokio::test]
    async fn corrupt_index_is_backed_up_then_rebuilt() {
        let dir = tempdir().unwrap();
        let research = dir.path().join("docs/research");
        std::fs::create_dir_all(&research).unwrap();
        std::fs::write(research.join("INDEX.md"), "garbage without heading").unwrap();
        std::fs::write(research.join("a-study.md"), "# A Study\n").unwrap();

        regenerate_index(&research, "Research Index").await.unwrap();

        assert!(research.join("INDEX.md.corrupt.bak").exists());
        let rebuilt = std::fs::read_to_string(research.join("INDEX.md")).unwrap();
        assert!(rebuilt.starts_with("# Research Index"));
        assert!(rebuilt.contains("a-study"));
    }

    #[tokio::test]
    async fn bug_report_lands_in_dated_category_dir() {
        let dir = tempdir().unwrap();
        let (app, _context) = app_with_project(dir.path()).await;

        let response = manage_docs(
            &app,
            ManageDocsRequest {
                action: "create_bug_report".into(),
                doc_name: Some("Null Deref".into()),
                metadata: Some(json!({
                    "category": "auth",
                    "severity": "high",
                    "component": "token-refresh",
                    "status": "open",
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_value();

        let path = response["path"].as_str().unwrap();
        let date = Utc::now().format("%Y-%m-%d").to_string();
        assert!(path.contains(&format!("docs/bugs/auth/{date}_null-deref/report.md")));
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("Severity: high"));
        assert!(body.contains("<!-- ID: reproduction -->"));
    }

    #[tokio::test]
    async fn validate_crosslinks_reports_broken_targets() {
        let dir = tempdir().unwrap();
        let (app, context) = app_with_project(dir.path()).await;
        write_doc(
            &context,
            "architecture",
            "# Guide\n\nSee [plan](PHASE_PLAN.md) and [ghost](MISSING.md).\n",
        );
        write_doc(&context, "phase_plan", "# Plan\n");

        let response = manage_docs(
            &app,
            ManageDocsRequest {
                action: "validate_crosslinks".into(),
                doc: Some("architecture".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_value();

        assert_eq!(response["checked"], json!(2));
        assert_eq!(response["valid"], json!(1));
        let broken = response["broken_links"].as_array().unwrap();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0]["target"], json!("MISSING.md"));
    }

    #[tokio::test]
    async fn batch_collects_per_operation_results() {
        let dir = tempdir().unwrap();
        let (app, context) = app_with_project(dir.path()).await;
        write_doc(&context, "architecture", ARCH);

        let response = manage_docs(
            &app,
            ManageDocsRequest {
                action: "batch".into(),
                metadata: Some(json!({
                    "operations": [
                        {
                            "action": "append",
                            "doc": "architecture",
                            "content": "Appendix A.\n",
                        },
                        {
                            "action": "replace_section",
                            "doc": "architecture",
                            "section": "missing_anchor",
                            "content": "x",
                        },
                    ],
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .into_value();

        assert_eq!(response["succeeded"], json!(1));
        assert_eq!(response["failed"], json!(1));
        let results = response["results"].as_array().unwrap();
        assert_eq!(results[0]["ok"], json!(true));
        assert_eq!(results[1]["error"]["code"], json!("SectionNotFound"));
    }

    #[tokio::test]
    async fn generate_toc_inserts_anchored_section() {
        let dir = tempdir().unwrap();
        let (app, context) = app_with_project(dir.path()).await;
        let path = write_doc(&context, "architecture", ARCH);

        manage_docs(
            &app,
            ManageDocsRequest {
                action: "generate_toc".into(),
                doc: Some("architecture".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let updated = std::fs::read_to_string(&path).unwrap();
        assert!(updated.contains("<!-- ID: toc -->"));
        assert!(updated.contains("- [Overview](#overview)"));
        assert!(updated.contains("- [Decisions](#decisions)"));
    }
}
