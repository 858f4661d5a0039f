// crates/db/src/queries/projects.rs
// Project row CRUD and per-project metrics counters.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::encode_ts;
use crate::{Database, DbError, DbResult};

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: i64,
    pub name: String,
    pub repo_root: String,
    pub progress_log_path: String,
    pub description: String,
    pub status: String,
    pub created_at: String,
    pub last_entry_at: Option<String>,
    pub last_access_at: Option<String>,
    pub last_status_change: Option<String>,
    /// Comma-separated tag list.
    pub tags: String,
    /// JSON blob parsed application-side.
    pub meta: String,
}

impl ProjectRow {
    pub fn tag_set(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    pub fn meta_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.meta).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct MetricsRow {
    pub project_id: i64,
    pub total_entries: i64,
    pub progress_entries: i64,
    pub bug_entries: i64,
    pub security_entries: i64,
    pub doc_update_count: i64,
    pub last_doc_update_at: Option<String>,
}

impl Database {
    /// Insert the project if missing; returns the row either way.
    /// Existing rows keep their stored fields (idempotent set_project).
    pub async fn ensure_project(
        &self,
        name: &str,
        repo_root: &str,
        progress_log_path: &str,
        description: Option<&str>,
    ) -> DbResult<ProjectRow> {
        let now = encode_ts(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO scribe_projects (name, repo_root, progress_log_path, description, status, created_at, last_access_at)
            VALUES (?1, ?2, ?3, ?4, 'planning', ?5, ?5)
            ON CONFLICT(name) DO UPDATE SET
                repo_root = excluded.repo_root,
                progress_log_path = excluded.progress_log_path,
                description = CASE
                    WHEN excluded.description <> '' THEN excluded.description
                    ELSE scribe_projects.description
                END
            "#,
        )
        .bind(name)
        .bind(repo_root)
        .bind(progress_log_path)
        .bind(description.unwrap_or(""))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let row = self
            .get_project_row(name)
            .await?
            .ok_or_else(|| DbError::ProjectNotFound(name.to_string()))?;

        sqlx::query("INSERT OR IGNORE INTO scribe_metrics (project_id) VALUES (?1)")
            .bind(row.id)
            .execute(&self.pool)
            .await?;

        Ok(row)
    }

    pub async fn get_project_row(&self, name: &str) -> DbResult<Option<ProjectRow>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT * FROM scribe_projects WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_project_rows(&self) -> DbResult<Vec<ProjectRow>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            "SELECT * FROM scribe_projects ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_metrics(&self, project_id: i64) -> DbResult<MetricsRow> {
        sqlx::query("INSERT OR IGNORE INTO scribe_metrics (project_id) VALUES (?1)")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        let row = sqlx::query_as::<_, MetricsRow>(
            "SELECT * FROM scribe_metrics WHERE project_id = ?1",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn touch_project_access(&self, name: &str) -> DbResult<()> {
        sqlx::query("UPDATE scribe_projects SET last_access_at = ?1 WHERE name = ?2")
            .bind(encode_ts(Utc::now()))
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record an appended entry: bumps counters and `last_entry_at`.
    pub async fn touch_project_entry(&self, name: &str, log_type: &str) -> DbResult<()> {
        let row = self
            .get_project_row(name)
            .await?
            .ok_or_else(|| DbError::ProjectNotFound(name.to_string()))?;
        sqlx::query("UPDATE scribe_projects SET last_entry_at = ?1 WHERE id = ?2")
            .bind(encode_ts(Utc::now()))
            .bind(row.id)
            .execute(&self.pool)
            .await?;

        let column = match log_type {
            "bugs" => "bug_entries",
            "security" => "security_entries",
            _ => "progress_entries",
        };
        sqlx::query(&format!(
            "UPDATE scribe_metrics SET total_entries = total_entries + 1, {column} = {column} + 1 WHERE project_id = ?1"
        ))
        .bind(row.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_project_status(&self, name: &str, status: &str) -> DbResult<()> {
        let now = encode_ts(Utc::now());
        let changed = sqlx::query(
            "UPDATE scribe_projects SET status = ?1, last_status_change = ?2 WHERE name = ?3",
        )
        .bind(status)
        .bind(&now)
        .bind(name)
        .execute(&self.pool)
        .await?;
        if changed.rows_affected() == 0 {
            return Err(DbError::ProjectNotFound(name.to_string()));
        }
        Ok(())
    }

    pub async fn set_project_tags(&self, name: &str, tags: &[String]) -> DbResult<()> {
        sqlx::query("UPDATE scribe_projects SET tags = ?1 WHERE name = ?2")
            .bind(tags.join(","))
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_project_meta(&self, name: &str, meta_json: &str) -> DbResult<()> {
        sqlx::query("UPDATE scribe_projects SET meta = ?1 WHERE name = ?2")
            .bind(meta_json)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a documentation update in the metrics counters.
    pub async fn touch_doc_update(&self, project_id: i64) -> DbResult<()> {
        sqlx::query(
            "UPDATE scribe_metrics SET doc_update_count = doc_update_count + 1, last_doc_update_at = ?1 WHERE project_id = ?2",
        )
        .bind(encode_ts(Utc::now()))
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a project and every dependent row.
    pub async fn delete_project(&self, name: &str) -> DbResult<u64> {
        let Some(row) = self.get_project_row(name).await? else {
            return Ok(0);
        };
        let mut tx = self.pool.begin().await?;
        for table in [
            "scribe_entries",
            "scribe_metrics",
            "dev_plans",
            "phases",
            "doc_changes",
            "rotation_history",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE project_id = ?1"))
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM agent_recent_projects WHERE project_name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM scribe_projects WHERE id = ?1")
            .bind(row.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }

    /// Register (or bump) a dev-plan document for a project.
    pub async fn upsert_dev_plan(
        &self,
        project_id: i64,
        plan_type: &str,
        file_path: &str,
        metadata_json: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dev_plans (project_id, plan_type, file_path, version, metadata)
            VALUES (?1, ?2, ?3, 1, ?4)
            ON CONFLICT(project_id, plan_type) DO UPDATE SET
                file_path = excluded.file_path,
                version = dev_plans.version + 1,
                metadata = excluded.metadata
            "#,
        )
        .bind(project_id)
        .bind(plan_type)
        .bind(file_path)
        .bind(metadata_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_dev_plans(&self, project_id: i64) -> DbResult<Vec<(String, String, i64)>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT plan_type, file_path, version FROM dev_plans WHERE project_id = ?1 ORDER BY plan_type",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Record (or move) a phase of the project's phase plan.
    pub async fn upsert_phase(
        &self,
        project_id: i64,
        name: &str,
        status: &str,
        position: i64,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO phases (project_id, name, status, position)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(project_id, name) DO UPDATE SET
                status = excluded.status,
                position = excluded.position
            "#,
        )
        .bind(project_id)
        .bind(name)
        .bind(status)
        .bind(position)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Phases in plan order: `(name, status, position)`.
    pub async fn list_phases(&self, project_id: i64) -> DbResult<Vec<(String, String, i64)>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT name, status, position FROM phases WHERE project_id = ?1 ORDER BY position, name",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn ensure_project_is_idempotent() {
        let db = Database::new_in_memory().await.unwrap();
        let first = db
            .ensure_project("demo", "/repo", "/repo/docs/dev_plans/demo/PROGRESS_LOG.md", None)
            .await
            .unwrap();
        let second = db
            .ensure_project("demo", "/repo", "/repo/docs/dev_plans/demo/PROGRESS_LOG.md", None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, "planning");
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn touch_entry_bumps_counters() {
        let db = Database::new_in_memory().await.unwrap();
        let row = db.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();

        db.touch_project_entry("demo", "progress").await.unwrap();
        db.touch_project_entry("demo", "bugs").await.unwrap();
        db.touch_project_entry("demo", "bugs").await.unwrap();

        let metrics = db.get_metrics(row.id).await.unwrap();
        assert_eq!(metrics.total_entries, 3);
        assert_eq!(metrics.progress_entries, 1);
        assert_eq!(metrics.bug_entries, 2);

        let refreshed = db.get_project_row("demo").await.unwrap().unwrap();
        assert!(refreshed.last_entry_at.is_some());
    }

    #[tokio::test]
    async fn status_change_records_timestamp() {
        let db = Database::new_in_memory().await.unwrap();
        db.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();
        db.set_project_status("demo", "in_progress").await.unwrap();

        let row = db.get_project_row("demo").await.unwrap().unwrap();
        assert_eq!(row.status, "in_progress");
        assert!(row.last_status_change.is_some());

        let err = db.set_project_status("ghost", "complete").await.unwrap_err();
        assert!(matches!(err, DbError::ProjectNotFound(_)));
    }

    #[tokio::test]
    async fn tags_round_trip_as_comma_text() {
        let db = Database::new_in_memory().await.unwrap();
        db.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();
        db.set_project_tags("demo", &["backend".into(), "ledger".into()])
            .await
            .unwrap();

        let row = db.get_project_row("demo").await.unwrap().unwrap();
        assert_eq!(row.tag_set(), vec!["backend", "ledger"]);
    }

    #[tokio::test]
    async fn delete_project_removes_dependents() {
        let db = Database::new_in_memory().await.unwrap();
        let row = db.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();
        db.upsert_dev_plan(row.id, "architecture", "/r/ARCH.md", "{}")
            .await
            .unwrap();

        assert_eq!(db.delete_project("demo").await.unwrap(), 1);
        assert!(db.get_project_row("demo").await.unwrap().is_none());
        assert!(db.list_dev_plans(row.id).await.unwrap().is_empty());
        // Deleting again is a no-op.
        assert_eq!(db.delete_project("demo").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn phases_upsert_and_order_by_position() {
        let db = Database::new_in_memory().await.unwrap();
        let row = db.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();

        db.upsert_phase(row.id, "phase_1", "pending", 1).await.unwrap();
        db.upsert_phase(row.id, "phase_0", "done", 0).await.unwrap();
        db.upsert_phase(row.id, "phase_1", "in_progress", 1).await.unwrap();

        let phases = db.list_phases(row.id).await.unwrap();
        assert_eq!(
            phases,
            vec![
                ("phase_0".to_string(), "done".to_string(), 0),
                ("phase_1".to_string(), "in_progress".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn dev_plan_upsert_bumps_version() {
        let db = Database::new_in_memory().await.unwrap();
        let row = db.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();

        db.upsert_dev_plan(row.id, "architecture", "/r/ARCH.md", "{}")
            .await
            .unwrap();
        db.upsert_dev_plan(row.id, "architecture", "/r/ARCH.md", "{}")
            .await
            .unwrap();

        let plans = db.list_dev_plans(row.id).await.unwrap();
        assert_eq!(plans, vec![("architecture".to_string(), "/r/ARCH.md".to_string(), 2)]);
    }
}
