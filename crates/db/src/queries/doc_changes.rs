// crates/db/src/queries/doc_changes.rs
// Audit rows for document-manager actions.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::encode_ts;
use crate::{Database, DbResult};

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DocChangeRow {
    #[sqlx(default)]
    pub id: i64,
    pub project_id: i64,
    pub doc: String,
    pub section: Option<String>,
    pub action: String,
    pub agent: String,
    pub metadata: String,
    pub sha_before: Option<String>,
    pub sha_after: Option<String>,
    pub ts: String,
}

impl Database {
    pub async fn insert_doc_change(
        &self,
        project_id: i64,
        doc: &str,
        section: Option<&str>,
        action: &str,
        agent: &str,
        metadata_json: &str,
        sha_before: Option<&str>,
        sha_after: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO doc_changes (project_id, doc, section, action, agent, metadata, sha_before, sha_after, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(project_id)
        .bind(doc)
        .bind(section)
        .bind(action)
        .bind(agent)
        .bind(metadata_json)
        .bind(sha_before)
        .bind(sha_after)
        .bind(encode_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_doc_changes(
        &self,
        project_id: i64,
        limit: u64,
    ) -> DbResult<Vec<DocChangeRow>> {
        let rows = sqlx::query_as::<_, DocChangeRow>(
            "SELECT * FROM doc_changes WHERE project_id = ?1 ORDER BY ts DESC, id DESC LIMIT ?2",
        )
        .bind(project_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_doc_changes(&self, project_id: i64) -> DbResult<u64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM doc_changes WHERE project_id = ?1")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn doc_changes_record_and_list_newest_first() {
        let db = Database::new_in_memory().await.unwrap();
        let project = db.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();

        db.insert_doc_change(
            project.id,
            "architecture",
            Some("overview"),
            "replace_section",
            "DocBot",
            "{}",
            Some("aaa"),
            Some("bbb"),
        )
        .await
        .unwrap();
        db.insert_doc_change(
            project.id,
            "checklist",
            None,
            "append",
            "DocBot",
            "{}",
            Some("bbb"),
            Some("ccc"),
        )
        .await
        .unwrap();

        let rows = db.list_doc_changes(project.id, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].doc, "checklist");
        assert_eq!(rows[1].section.as_deref(), Some("overview"));
        assert_eq!(db.count_doc_changes(project.id).await.unwrap(), 2);
    }
}
