// crates/db/src/queries/rotations.rs
// Rotation audit storage. One row per executed rotation; the hash-chain
// anchors live in the state manager and are duplicated here for audit.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Database, DbResult};

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct RotationRow {
    pub rotation_id: String,
    pub project_id: i64,
    pub log_type: String,
    pub sequence_number: i64,
    pub previous_hash: Option<String>,
    pub archive_path: String,
    pub archive_sha256: Option<String>,
    pub rotated_entry_count: i64,
    pub rotation_timestamp: String,
    pub duration_ms: i64,
    pub metadata: String,
}

impl Database {
    pub async fn insert_rotation(&self, rotation: &RotationRow) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rotation_history
                (rotation_id, project_id, log_type, sequence_number, previous_hash,
                 archive_path, archive_sha256, rotated_entry_count, rotation_timestamp,
                 duration_ms, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&rotation.rotation_id)
        .bind(rotation.project_id)
        .bind(&rotation.log_type)
        .bind(rotation.sequence_number)
        .bind(&rotation.previous_hash)
        .bind(&rotation.archive_path)
        .bind(&rotation.archive_sha256)
        .bind(rotation.rotated_entry_count)
        .bind(&rotation.rotation_timestamp)
        .bind(rotation.duration_ms)
        .bind(&rotation.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_rotations(&self, project_id: i64) -> DbResult<Vec<RotationRow>> {
        let rows = sqlx::query_as::<_, RotationRow>(
            "SELECT * FROM rotation_history WHERE project_id = ?1 ORDER BY sequence_number",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn last_rotation(&self, project_id: i64, log_type: &str) -> DbResult<Option<RotationRow>> {
        let row = sqlx::query_as::<_, RotationRow>(
            "SELECT * FROM rotation_history WHERE project_id = ?1 AND log_type = ?2 ORDER BY sequence_number DESC LIMIT 1",
        )
        .bind(project_id)
        .bind(log_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rotation(project_id: i64, seq: i64, id: &str) -> RotationRow {
        RotationRow {
            rotation_id: id.to_string(),
            project_id,
            log_type: "progress".into(),
            sequence_number: seq,
            previous_hash: (seq > 1).then(|| "prev".to_string()),
            archive_path: format!("/r/PROGRESS_LOG.md.archive_{id}.md"),
            archive_sha256: Some("ab".repeat(32)),
            rotated_entry_count: 512,
            rotation_timestamp: "2026-01-05T12:00:00Z".into(),
            duration_ms: 42,
            metadata: "{}".into(),
        }
    }

    #[tokio::test]
    async fn rotations_record_in_sequence_order() {
        let db = Database::new_in_memory().await.unwrap();
        let project = db.ensure_project("demo", "/r", "/r/p.md", None).await.unwrap();

        db.insert_rotation(&rotation(project.id, 2, "rot-b")).await.unwrap();
        db.insert_rotation(&rotation(project.id, 1, "rot-a")).await.unwrap();

        let rows = db.list_rotations(project.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rotation_id, "rot-a");
        assert_eq!(rows[1].rotation_id, "rot-b");

        let last = db.last_rotation(project.id, "progress").await.unwrap().unwrap();
        assert_eq!(last.sequence_number, 2);
        assert!(db.last_rotation(project.id, "bugs").await.unwrap().is_none());
    }
}
