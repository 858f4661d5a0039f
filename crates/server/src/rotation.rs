// crates/server/src/rotation.rs
// Rotation engine: estimate → classify (with hysteresis) → refine →
// dry-run or execute. Execution swaps the live file for a fresh header
// under the file lock, chains the archive hash, and records audit rows.
//
// Estimation escalation order: cache → EMA → tail sample → precise count.
// `dry_run_mode=precise` forces the full count (and feeds the EMA).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use scribe_core::atomic::{fsync_dir, preflight_backup, sibling_with_suffix};
use scribe_core::config::LogTypeConfig;
use scribe_core::entry::format_line_timestamp;
use scribe_core::error::FileError;
use scribe_core::estimator::{
    self, blend_ema, classify, estimation_band, EstimationMethod, ThresholdClass, ALPHA_PRECISE,
};
use scribe_core::integrity::hash_and_count;
use scribe_core::journal;
use scribe_core::lock::FileLock;
use scribe_core::state::FileStats;
use scribe_db::RotationRow;

use crate::error::{ToolError, ToolResult};
use crate::projects::{resolve_project, ProjectContext};
use crate::response::ToolResponse;
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RotationRequest {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Single log type (default `progress`).
    #[serde(default)]
    pub log_type: Option<String>,
    /// Batch: rotate these types in one call.
    #[serde(default)]
    pub log_types: Option<Vec<String>>,
    /// Rotate every configured log type.
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// `estimate` (default) or `precise`.
    #[serde(default)]
    pub dry_run_mode: Option<String>,
    /// Rotate only when the estimated count clears the threshold.
    #[serde(default)]
    pub auto_threshold: bool,
    #[serde(default)]
    pub threshold_entries: Option<u64>,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub custom_metadata: Option<Value>,
}

/// rotate_log tool: single, batch, or all-types rotation.
pub async fn rotate_log(app: &AppState, req: RotationRequest) -> ToolResult<ToolResponse> {
    let context = resolve_project(
        app,
        req.project.as_deref(),
        req.agent_id.as_deref(),
        req.session_id.as_deref(),
        true,
    )
    .await?
    .expect("require=true never yields None");

    let targets: Vec<String> = if req.all {
        app.settings.log_types.keys().cloned().collect()
    } else if let Some(types) = &req.log_types {
        types.clone()
    } else {
        vec![req.log_type.clone().unwrap_or_else(|| "progress".into())]
    };

    if targets.len() == 1 {
        let outcome = rotate_one(app, &context, &targets[0], &req).await?;
        let mut response = ToolResponse::ok();
        if let Value::Object(map) = outcome {
            for (k, v) in map {
                response.set_field(&k, v);
            }
        }
        return Ok(response);
    }

    // Batch: failures are per-log; the response summarizes both sides.
    let mut results: Vec<Value> = Vec::new();
    let mut succeeded = 0u64;
    let mut failed = 0u64;
    for target in &targets {
        match rotate_one(app, &context, target, &req).await {
            Ok(outcome) => {
                succeeded += 1;
                results.push(json!({ "log_type": target, "ok": true, "result": outcome }));
            }
            Err(e) => {
                failed += 1;
                results.push(json!({
                    "log_type": target,
                    "ok": false,
                    "error": { "code": e.code(), "message": e.to_string() },
                }));
            }
        }
    }
    Ok(ToolResponse::ok()
        .field("results", json!(results))
        .field("succeeded", succeeded)
        .field("failed", failed))
}

async fn rotate_one(
    app: &AppState,
    context: &ProjectContext,
    log_type: &str,
    req: &RotationRequest,
) -> ToolResult<Value> {
    let config = app.settings.log_type(log_type);
    let path = context.dir.join(&config.file_name);
    let precise_mode = req
        .dry_run_mode
        .as_deref()
        .map(|m| m.eq_ignore_ascii_case("precise"))
        .unwrap_or(false);

    // Snapshot. Missing or empty files cannot rotate; auto mode reports
    // it as a skip, explicit mode as an error.
    let stat = match estimator::stat_snapshot(&path) {
        Ok(stat) if stat.size_bytes > 0 => stat,
        Ok(_) => {
            if req.auto_threshold || req.dry_run {
                return Ok(json!({
                    "rotation_skipped": true,
                    "reason": "file_empty",
                    "log_type": config.name,
                }));
            }
            return Err(ToolError::File(FileError::RotationRejected {
                path,
                reason: "cannot rotate empty file".into(),
            }));
        }
        Err(_) => {
            if req.auto_threshold || req.dry_run {
                return Ok(json!({
                    "rotation_skipped": true,
                    "reason": "file_missing",
                    "log_type": config.name,
                }));
            }
            return Err(ToolError::File(FileError::RotationRejected {
                path,
                reason: "cannot rotate non-existent file".into(),
            }));
        }
    };

    // Estimate, then sharpen while the classification stays undecided.
    let threshold = req
        .threshold_entries
        .unwrap_or(config.rotation_threshold_entries);
    let cached = app
        .state
        .file_stats(&context.name, &config.name)
        .await
        .filter(|s| s.initialized)
        .map(|s| s.as_cached());
    let mut estimate = estimator::estimate_entry_count(&stat, cached.as_ref());
    let mut decision = classify(estimate.count, threshold, estimate.approximate);

    if decision == ThresholdClass::Undecided && estimate.approximate {
        if let Ok(refined) = estimator::refine_with_tail_sample(&path, &stat).await {
            estimate = refined;
            decision = classify(estimate.count, threshold, true);
        }
    }
    if precise_mode || (decision == ThresholdClass::Undecided && req.auto_threshold) {
        let integrity = hash_and_count(&path).await?;
        let observed = integrity.size_bytes as f64 / integrity.line_count.max(1) as f64;
        let ema = blend_ema(
            cached.as_ref().and_then(|c| c.ema_bytes_per_line),
            observed,
            ALPHA_PRECISE,
        );
        app.state
            .update_file_stats(
                &context.name,
                &config.name,
                FileStats {
                    size_bytes: integrity.size_bytes,
                    line_count: integrity.line_count,
                    ema_bytes_per_line: Some(ema),
                    mtime_ns: stat.mtime_ns,
                    inode: stat.inode,
                    source: "precise".into(),
                    initialized: true,
                },
            )
            .await?;
        estimate = scribe_core::EntryCountEstimate {
            count: integrity.line_count,
            approximate: false,
            method: EstimationMethod::Precise,
            bytes_per_line: observed,
        };
        decision = classify(estimate.count, threshold, false);
    }

    let band = estimation_band(threshold);
    let decision_text = match decision {
        ThresholdClass::Below => "below",
        ThresholdClass::Above => "above",
        ThresholdClass::Undecided => "undecided",
    };

    if req.auto_threshold && decision != ThresholdClass::Above {
        return Ok(json!({
            "rotation_skipped": true,
            "reason": "threshold_not_reached",
            "estimation_decision": decision_text,
            "estimated_entries": estimate.count,
            "estimation_method": estimate.method,
            "estimation_band": band,
            "threshold": threshold,
            "log_type": config.name,
        }));
    }

    let suffix = build_archive_suffix(req.suffix.as_deref(), &config.name);
    if !req.confirm {
        // Dry run: project the plan without touching files. The rotation
        // id is minted at execute time, so the name carries a placeholder.
        return Ok(json!({
            "dry_run": true,
            "projected_archive": archive_path_for(&path, &suffix, "pending").display().to_string(),
            "estimated_entries": estimate.count,
            "estimation_method": estimate.method,
            "estimation_decision": decision_text,
            "estimation_band": band,
            "threshold": threshold,
            "log_type": config.name,
        }));
    }

    execute_rotation(app, context, &config, &path, &suffix, estimate.count, req).await
}

fn build_archive_suffix(requested: Option<&str>, log_type: &str) -> String {
    match requested {
        Some(raw) => {
            let cleaned: String = raw
                .trim()
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            if cleaned.is_empty() {
                format!("{log_type}_archive")
            } else {
                cleaned
            }
        }
        None => format!("{log_type}_archive"),
    }
}

fn archive_path_for(path: &Path, suffix: &str, rotation_short: &str) -> PathBuf {
    sibling_with_suffix(path, &format!(".{suffix}_{rotation_short}.md"))
}

async fn execute_rotation(
    app: &AppState,
    context: &ProjectContext,
    config: &LogTypeConfig,
    path: &Path,
    suffix: &str,
    entries_rotated: u64,
    req: &RotationRequest,
) -> ToolResult<Value> {
    let started = Instant::now();
    let rotation_id = Uuid::new_v4().to_string();
    let rotation_short: String = rotation_id.replace('-', "").chars().take(8).collect();
    let archive = archive_path_for(path, suffix, &rotation_short);

    let sequence = app.state.reserve_sequence(&context.name).await?;
    let previous_hash = app.state.hash_chain(&context.name).await.last_hash;

    let backup = preflight_backup(path).await?;

    // Header content, template-first with the hand-written fallback.
    let timestamp = format_line_timestamp(Utc::now());
    let archive_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let title = default_title(&config.name);
    let mut template_meta = BTreeMap::new();
    template_meta.insert("title".to_string(), title.clone());
    template_meta.insert("timestamp".to_string(), timestamp.clone());
    template_meta.insert("rotation_id".to_string(), rotation_short.clone());
    template_meta.insert("project".to_string(), context.name.clone());
    template_meta.insert("archive_name".to_string(), archive_name.clone());
    let header = app
        .templates
        .render(&config.template_name, &template_meta)
        .unwrap_or_else(|| {
            scribe_core::template::fallback_rotation_header(
                &title,
                &context.name,
                &rotation_short,
                &timestamp,
                &archive_name,
            )
        });
    let header_lines = header.lines().count() as u64;

    // The swap itself, serialized behind the same lock appends take.
    {
        let _lock = FileLock::acquire(path).await?;
        let task_path = path.to_path_buf();
        let task_archive = archive.clone();
        let task_header = header.clone();
        tokio::task::spawn_blocking(move || swap_files(&task_path, &task_archive, &task_header))
            .await
            .map_err(|e| {
                ToolError::File(FileError::AtomicWriteFailure {
                    path: path.to_path_buf(),
                    message: format!("rotation task panicked: {e}"),
                })
            })??;
    }

    // Post-swap bookkeeping. The archive exists now; everything below is
    // audit metadata and must not destroy it on failure.
    let mut warnings: Vec<Value> = Vec::new();
    let integrity = match hash_and_count(&archive).await {
        Ok(integrity) => Some(integrity),
        Err(e) => {
            warn!(error = %e, "archive integrity pass failed");
            warnings.push(json!({
                "code": "RotationIntegrityWarning",
                "message": format!("archive hash unavailable: {e}"),
            }));
            None
        }
    };
    let archive_sha = integrity.as_ref().map(|i| i.sha256.clone());

    journal::record_rotation(
        path,
        &archive,
        &rotation_id,
        sequence,
        entries_rotated,
        &config.name,
    )
    .await;

    let mut chain_value = json!(null);
    if let Some(sha) = &archive_sha {
        match app.state.commit_rotation(&context.name, sha).await {
            Ok(chain) => {
                chain_value = json!({
                    "last_hash": chain.last_hash,
                    "root_hash": chain.root_hash,
                    "last_sequence": chain.last_sequence.max(sequence),
                });
            }
            Err(e) => warnings.push(json!({
                "code": "HashChainFailure",
                "message": e.to_string(),
            })),
        }
    }

    // Audit row, best-effort.
    if let Ok(Some(project_row)) = app.db.get_project_row(&context.name).await {
        let rotation_row = RotationRow {
            rotation_id: rotation_id.clone(),
            project_id: project_row.id,
            log_type: config.name.clone(),
            sequence_number: sequence as i64,
            previous_hash: previous_hash.clone(),
            archive_path: archive.display().to_string(),
            archive_sha256: archive_sha.clone(),
            rotated_entry_count: entries_rotated as i64,
            rotation_timestamp: scribe_db::queries::encode_ts(Utc::now()),
            duration_ms: started.elapsed().as_millis() as i64,
            metadata: req
                .custom_metadata
                .clone()
                .unwrap_or_else(|| json!({}))
                .to_string(),
        };
        if let Err(e) = app.db.insert_rotation(&rotation_row).await {
            warn!(error = %e, "rotation audit insert failed");
            warnings.push(json!({
                "code": "AuditFailure",
                "message": e.to_string(),
            }));
        }
    }

    // Fresh file: the template header is a precise count.
    if let Ok(new_stat) = estimator::stat_snapshot(path) {
        let observed = integrity
            .as_ref()
            .map(|i| i.size_bytes as f64 / i.line_count.max(1) as f64)
            .unwrap_or(scribe_core::estimator::DEFAULT_BYTES_PER_LINE);
        let previous_ema = app
            .state
            .file_stats(&context.name, &config.name)
            .await
            .and_then(|s| s.ema_bytes_per_line);
        let _ = app
            .state
            .update_file_stats(
                &context.name,
                &config.name,
                FileStats {
                    size_bytes: new_stat.size_bytes,
                    line_count: header_lines,
                    ema_bytes_per_line: Some(blend_ema(previous_ema, observed, ALPHA_PRECISE)),
                    mtime_ns: new_stat.mtime_ns,
                    inode: new_stat.inode,
                    source: "template".into(),
                    initialized: true,
                },
            )
            .await;
    }

    let _ = tokio::fs::remove_file(&backup).await;

    info!(
        project = %context.name,
        log_type = %config.name,
        sequence,
        archive = %archive.display(),
        "rotation complete"
    );

    let mut result = json!({
        "rotated": true,
        "rotation_id": rotation_id,
        "sequence_number": sequence,
        "archive_path": archive.display().to_string(),
        "archive_sha256": archive_sha,
        "previous_hash": previous_hash,
        "entries_rotated": entries_rotated,
        "integrity_verified": archive_sha.is_some(),
        "hash_chain": chain_value,
        "duration_ms": started.elapsed().as_millis() as u64,
        "log_type": config.name,
    });
    if !warnings.is_empty() {
        result["warnings"] = json!(warnings);
    }
    Ok(result)
}

fn default_title(log_type: &str) -> String {
    match log_type {
        "progress" => "Progress Log".to_string(),
        "doc_updates" => "Documentation Log".to_string(),
        "security" => "Security Log".to_string(),
        "bugs" => "Bug Log".to_string(),
        other => {
            let mut title = other.replace('_', " ");
            if let Some(first) = title.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            format!("{title} Log")
        }
    }
}

/// Archive-and-replace under the caller's lock: current → archive, fresh
/// header → current, parent fsync. Rolls the archive back on failure.
fn swap_files(path: &Path, archive: &Path, header: &str) -> Result<(), FileError> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| FileError::AtomicWriteFailure {
        path: path.to_path_buf(),
        message: "log file has no parent directory".into(),
    })?;

    // Stage the fresh header first so the window without a live log file
    // is a single rename pair.
    let staged = sibling_with_suffix(path, ".new");
    {
        let mut file =
            std::fs::File::create(&staged).map_err(|e| FileError::io(staged.clone(), e))?;
        file.write_all(header.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| FileError::io(staged.clone(), e))?;
    }

    std::fs::rename(path, archive).map_err(|e| {
        let _ = std::fs::remove_file(&staged);
        FileError::io(path.to_path_buf(), e)
    })?;

    if let Err(e) = std::fs::rename(&staged, path) {
        // Roll the archive back so the live path never dangles.
        if let Err(rollback) = std::fs::rename(archive, path) {
            error!(
                archive = %archive.display(),
                path = %path.display(),
                error = %rollback,
                "CRITICAL: rotation rollback failed; live log path is missing"
            );
        }
        let _ = std::fs::remove_file(&staged);
        return Err(FileError::AtomicWriteFailure {
            path: path.to_path_buf(),
            message: format!("failed to install fresh log file: {e}"),
        });
    }

    fsync_dir(parent)
}
