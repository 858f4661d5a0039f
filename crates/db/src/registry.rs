// crates/db/src/registry.rs
// Project registry: a derived view over scribe_projects, scribe_metrics,
// and dev_plans. Lifecycle, activity scoring, and doc-drift flags are
// computed on every read; the only writes are the narrow operations at
// the bottom (ensure, touch, status, doc update).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::queries::{decode_ts, encode_ts};
use crate::{Database, DbError, DbResult, MetricsRow, ProjectRow};

/// The three documents a project needs before work starts.
pub const CORE_DOCS: [&str; 3] = ["architecture", "phase_plan", "checklist"];

/// Days without a documentation update (while entries flow) that flag drift.
const DRIFT_GAP_DAYS: f64 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StalenessLevel {
    Fresh,
    Warming,
    Stale,
    Frozen,
}

impl StalenessLevel {
    fn from_age_days(age: f64) -> Self {
        if age <= 2.0 {
            Self::Fresh
        } else if age <= 7.0 {
            Self::Warming
        } else if age <= 30.0 {
            Self::Stale
        } else {
            Self::Frozen
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub project_age_days: f64,
    pub days_since_last_entry: f64,
    pub days_since_last_access: f64,
    pub staleness_level: StalenessLevel,
    pub activity_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocsInfo {
    pub baseline_hashes: BTreeMap<String, String>,
    pub current_hashes: BTreeMap<String, String>,
    pub update_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_at: Option<String>,
    /// `{doc}_touched` / `{doc}_modified` plus the aggregate flags.
    pub flags: BTreeMap<String, bool>,
    pub docs_started: bool,
    pub docs_ready_for_work: bool,
    pub drift_score: f64,
}

/// A project with its computed registry fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectView {
    #[serde(flatten)]
    pub row: ProjectRow,
    pub metrics: MetricsRow,
    pub activity: ActivityInfo,
    pub docs: DocsInfo,
    pub doc_drift: bool,
    /// `(plan_type, file_path, version)` triples.
    pub dev_plans: Vec<(String, String, i64)>,
    /// `(name, status, position)` triples from the phase plan.
    pub phases: Vec<(String, String, i64)>,
}

/// Derived-view access plus the registry's narrow write set.
#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    db: Database,
}

impl ProjectRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Create the project if needed (idempotent) and return its view.
    pub async fn ensure_project(
        &self,
        name: &str,
        repo_root: &str,
        progress_log_path: &str,
        description: Option<&str>,
    ) -> DbResult<ProjectView> {
        let row = self
            .db
            .ensure_project(name, repo_root, progress_log_path, description)
            .await?;
        self.view_of(row, Utc::now()).await
    }

    pub async fn get_project(&self, name: &str) -> DbResult<Option<ProjectView>> {
        match self.db.get_project_row(name).await? {
            Some(row) => Ok(Some(self.view_of(row, Utc::now()).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_projects(&self) -> DbResult<Vec<ProjectView>> {
        let now = Utc::now();
        let mut views = Vec::new();
        for row in self.db.list_project_rows().await? {
            views.push(self.view_of(row, now).await?);
        }
        Ok(views)
    }

    pub async fn touch_access(&self, name: &str) -> DbResult<()> {
        self.db.touch_project_access(name).await
    }

    /// Record an appended entry and apply the lifecycle promotion rule:
    /// a `planning` project moves to `in_progress` on its first progress
    /// entry once all three core docs exist. Returns whether it promoted.
    pub async fn touch_entry(
        &self,
        name: &str,
        log_type: &str,
        core_docs_present: bool,
    ) -> DbResult<bool> {
        self.db.touch_project_entry(name, log_type).await?;

        if log_type != "progress" || !core_docs_present {
            return Ok(false);
        }
        let row = self
            .db
            .get_project_row(name)
            .await?
            .ok_or_else(|| DbError::ProjectNotFound(name.to_string()))?;
        if row.status == "planning" {
            self.db.set_project_status(name, "in_progress").await?;
            info!(project = name, "promoted planning -> in_progress");
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn set_status(&self, name: &str, status: &str) -> DbResult<()> {
        self.db.set_project_status(name, status).await
    }

    /// Record a documentation update: bumps counters, maintains baseline
    /// and current hashes in the project meta, and registers dev plans.
    pub async fn record_doc_update(
        &self,
        name: &str,
        doc: &str,
        file_path: &str,
        sha_after: &str,
    ) -> DbResult<()> {
        let row = self
            .db
            .get_project_row(name)
            .await?
            .ok_or_else(|| DbError::ProjectNotFound(name.to_string()))?;

        let mut meta = row.meta_value();
        let docs = meta
            .as_object_mut()
            .expect("meta root is an object")
            .entry("docs")
            .or_insert_with(|| json!({}));
        if !docs.is_object() {
            *docs = json!({});
        }
        let docs_obj = docs.as_object_mut().expect("docs is an object");

        let baselines = docs_obj
            .entry("baseline_hashes")
            .or_insert_with(|| json!({}));
        if baselines.get(doc).is_none() {
            baselines
                .as_object_mut()
                .map(|m| m.insert(doc.to_string(), json!(sha_after)));
        }
        docs_obj
            .entry("current_hashes")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .map(|m| m.insert(doc.to_string(), json!(sha_after)));
        let count = docs_obj
            .get("update_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        docs_obj.insert("update_count".into(), json!(count + 1));
        docs_obj.insert("last_update_at".into(), json!(encode_ts(Utc::now())));

        self.db
            .update_project_meta(name, &meta.to_string())
            .await?;
        self.db.touch_doc_update(row.id).await?;
        self.db
            .upsert_dev_plan(row.id, doc, file_path, "{}")
            .await?;
        Ok(())
    }

    async fn view_of(&self, row: ProjectRow, now: DateTime<Utc>) -> DbResult<ProjectView> {
        let metrics = self.db.get_metrics(row.id).await?;
        let dev_plans = self.db.list_dev_plans(row.id).await?;
        let phases = self.db.list_phases(row.id).await?;

        let meta = row.meta_value();
        let docs = compute_docs_info(&meta, &metrics, &row, now);
        let activity = compute_activity(&row, &metrics, &docs, now);
        let doc_drift = compute_doc_drift(&row, &metrics, &docs);

        Ok(ProjectView {
            row,
            metrics,
            activity,
            docs,
            doc_drift,
            dev_plans,
            phases,
        })
    }
}

fn days_between(earlier: Option<&String>, now: DateTime<Utc>) -> Option<f64> {
    earlier
        .and_then(|t| decode_ts(t))
        .map(|t| (now - t).num_seconds().max(0) as f64 / 86_400.0)
}

fn compute_docs_info(
    meta: &serde_json::Value,
    metrics: &MetricsRow,
    row: &ProjectRow,
    now: DateTime<Utc>,
) -> DocsInfo {
    let docs_meta = meta.get("docs").cloned().unwrap_or_else(|| json!({}));
    let hashes = |key: &str| -> BTreeMap<String, String> {
        docs_meta
            .get(key)
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    };
    let baseline_hashes = hashes("baseline_hashes");
    let current_hashes = hashes("current_hashes");
    let update_count = docs_meta
        .get("update_count")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let last_update_at = docs_meta
        .get("last_update_at")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut flags = BTreeMap::new();
    for doc in current_hashes.keys().chain(baseline_hashes.keys()) {
        let touched = current_hashes.contains_key(doc);
        let modified = match (baseline_hashes.get(doc), current_hashes.get(doc)) {
            (Some(baseline), Some(current)) => baseline != current,
            _ => false,
        };
        flags.insert(format!("{doc}_touched"), touched);
        flags.insert(format!("{doc}_modified"), modified);
    }

    let docs_started = CORE_DOCS
        .iter()
        .any(|doc| current_hashes.contains_key(*doc));
    let docs_ready_for_work = CORE_DOCS
        .iter()
        .all(|doc| current_hashes.contains_key(*doc));
    flags.insert("docs_started".into(), docs_started);
    flags.insert("docs_ready_for_work".into(), docs_ready_for_work);

    // Drift score: how far documentation lags the entry stream.
    let entry_gap = match (
        days_between(row.last_entry_at.as_ref(), now),
        days_between(last_update_at.as_ref(), now),
    ) {
        (Some(entry_days), Some(doc_days)) => (doc_days - entry_days).max(0.0),
        (Some(_), None) if metrics.total_entries > 0 => DRIFT_GAP_DAYS,
        _ => 0.0,
    };
    let drift_score = if docs_ready_for_work {
        entry_gap / DRIFT_GAP_DAYS
    } else if metrics.total_entries > 0 {
        1.0
    } else {
        0.0
    };
    flags.insert("doc_drift_suspected".into(), drift_score >= 1.0);

    DocsInfo {
        baseline_hashes,
        current_hashes,
        update_count,
        last_update_at,
        flags,
        docs_started,
        docs_ready_for_work,
        drift_score,
    }
}

fn compute_activity(
    row: &ProjectRow,
    metrics: &MetricsRow,
    docs: &DocsInfo,
    now: DateTime<Utc>,
) -> ActivityInfo {
    let project_age_days = days_between(Some(&row.created_at), now).unwrap_or(0.0);
    let days_since_last_entry =
        days_between(row.last_entry_at.as_ref(), now).unwrap_or(project_age_days);
    let days_since_last_access =
        days_between(row.last_access_at.as_ref(), now).unwrap_or(project_age_days);

    let entry_rate = metrics.total_entries as f64 / project_age_days.max(1.0);
    let docs_ready = if docs.docs_ready_for_work { 1.0 } else { 0.0 };
    let priority_score = match row
        .meta_value()
        .get("priority")
        .and_then(|v| v.as_str())
        .unwrap_or("")
    {
        "high" => 2.0,
        "medium" => 1.0,
        _ => 0.0,
    };

    let activity_score = -days_since_last_entry - 0.5 * days_since_last_access
        + 1.5 * entry_rate
        + 2.0 * docs_ready
        + 0.5 * priority_score;

    ActivityInfo {
        project_age_days,
        days_since_last_entry,
        days_since_last_access,
        staleness_level: StalenessLevel::from_age_days(project_age_days),
        activity_score,
    }
}

fn compute_doc_drift(row: &ProjectRow, metrics: &MetricsRow, docs: &DocsInfo) -> bool {
    if !matches!(row.status.as_str(), "in_progress" | "complete") {
        return false;
    }
    if !docs.docs_ready_for_work {
        return true;
    }
    if metrics.progress_entries > 0 && metrics.doc_update_count == 0 {
        return true;
    }
    if let (Some(entry_at), Some(doc_at)) = (
        row.last_entry_at.as_ref().and_then(|t| decode_ts(t)),
        metrics.last_doc_update_at.as_ref().and_then(|t| decode_ts(t)),
    ) {
        let gap_days = (entry_at - doc_at).num_seconds() as f64 / 86_400.0;
        if gap_days >= DRIFT_GAP_DAYS {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn registry() -> ProjectRegistry {
        ProjectRegistry::new(Database::new_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn new_project_is_planning_and_fresh() {
        let registry = registry().await;
        let view = registry
            .ensure_project("demo", "/r", "/r/p.md", Some("Demo project"))
            .await
            .unwrap();

        assert_eq!(view.row.status, "planning");
        assert_eq!(view.activity.staleness_level, StalenessLevel::Fresh);
        assert!(!view.docs.docs_ready_for_work);
        assert!(!view.doc_drift, "planning projects never flag drift");
    }

    #[tokio::test]
    async fn promotion_needs_progress_entry_and_core_docs() {
        let registry = registry().await;
        registry.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();

        // Progress entry without docs: stays planning.
        let promoted = registry.touch_entry("demo", "progress", false).await.unwrap();
        assert!(!promoted);
        let view = registry.get_project("demo").await.unwrap().unwrap();
        assert_eq!(view.row.status, "planning");

        // Bug entry with docs present: still no promotion (not progress).
        let promoted = registry.touch_entry("demo", "bugs", true).await.unwrap();
        assert!(!promoted);

        // Progress entry with docs: promotes.
        let promoted = registry.touch_entry("demo", "progress", true).await.unwrap();
        assert!(promoted);
        let view = registry.get_project("demo").await.unwrap().unwrap();
        assert_eq!(view.row.status, "in_progress");

        // Further entries never demote or re-promote.
        let promoted = registry.touch_entry("demo", "progress", true).await.unwrap();
        assert!(!promoted);
    }

    #[tokio::test]
    async fn doc_updates_track_baseline_and_current_hashes() {
        let registry = registry().await;
        registry.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();

        registry
            .record_doc_update("demo", "architecture", "/r/ARCH.md", "hash-1")
            .await
            .unwrap();
        let view = registry.get_project("demo").await.unwrap().unwrap();
        assert_eq!(view.docs.baseline_hashes.get("architecture").unwrap(), "hash-1");
        assert_eq!(view.docs.current_hashes.get("architecture").unwrap(), "hash-1");
        assert_eq!(view.docs.flags.get("architecture_touched"), Some(&true));
        assert_eq!(view.docs.flags.get("architecture_modified"), Some(&false));
        assert_eq!(view.docs.update_count, 1);

        registry
            .record_doc_update("demo", "architecture", "/r/ARCH.md", "hash-2")
            .await
            .unwrap();
        let view = registry.get_project("demo").await.unwrap().unwrap();
        // Baseline stays at the first hash; current follows the edit.
        assert_eq!(view.docs.baseline_hashes.get("architecture").unwrap(), "hash-1");
        assert_eq!(view.docs.current_hashes.get("architecture").unwrap(), "hash-2");
        assert_eq!(view.docs.flags.get("architecture_modified"), Some(&true));
        assert_eq!(view.docs.update_count, 2);
    }

    #[tokio::test]
    async fn docs_ready_requires_all_three_core_docs() {
        let registry = registry().await;
        registry.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();

        registry
            .record_doc_update("demo", "architecture", "/r/a.md", "h")
            .await
            .unwrap();
        registry
            .record_doc_update("demo", "phase_plan", "/r/b.md", "h")
            .await
            .unwrap();
        let view = registry.get_project("demo").await.unwrap().unwrap();
        assert!(view.docs.docs_started);
        assert!(!view.docs.docs_ready_for_work);

        registry
            .record_doc_update("demo", "checklist", "/r/c.md", "h")
            .await
            .unwrap();
        let view = registry.get_project("demo").await.unwrap().unwrap();
        assert!(view.docs.docs_ready_for_work);
        assert_eq!(view.dev_plans.len(), 3);
    }

    #[tokio::test]
    async fn in_progress_without_docs_flags_drift() {
        let registry = registry().await;
        registry.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();
        registry.set_status("demo", "in_progress").await.unwrap();

        let view = registry.get_project("demo").await.unwrap().unwrap();
        assert!(view.doc_drift);
    }

    #[tokio::test]
    async fn entries_without_doc_updates_flag_drift() {
        let registry = registry().await;
        registry.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();
        for doc in CORE_DOCS {
            registry
                .record_doc_update("demo", doc, "/r/x.md", "h")
                .await
                .unwrap();
        }
        registry.touch_entry("demo", "progress", true).await.unwrap();

        let view = registry.get_project("demo").await.unwrap().unwrap();
        assert_eq!(view.row.status, "in_progress");
        // Doc updates happened (3 of them), so no drift.
        assert!(!view.doc_drift);

        let score = view.activity.activity_score;
        // Fresh project with docs ready: positive score from the docs term.
        assert!(score > 0.0, "expected positive activity score, got {score}");
    }
}
