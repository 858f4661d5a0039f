// crates/db/src/queries/sessions.rs
// Session bindings and per-agent project recency.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::encode_ts;
use crate::{Database, DbResult};

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub transport_session_id: Option<String>,
    pub agent_id: Option<String>,
    pub repo_root: String,
    pub mode: String,
    pub project_name: Option<String>,
}

impl Database {
    pub async fn upsert_session(&self, session: &SessionRow) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, transport_session_id, agent_id, repo_root, mode, project_name)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(session_id) DO UPDATE SET
                transport_session_id = excluded.transport_session_id,
                agent_id = excluded.agent_id,
                repo_root = excluded.repo_root,
                mode = excluded.mode,
                project_name = excluded.project_name
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.transport_session_id)
        .bind(&session.agent_id)
        .bind(&session.repo_root)
        .bind(&session.mode)
        .bind(&session.project_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> DbResult<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Record that an agent touched a project (most-recent-first recency).
    pub async fn touch_agent_recent(&self, agent_id: &str, project_name: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_recent_projects (agent_id, project_name, last_seen)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(agent_id, project_name) DO UPDATE SET last_seen = excluded.last_seen
            "#,
        )
        .bind(agent_id)
        .bind(project_name)
        .bind(encode_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn agent_recent_projects(
        &self,
        agent_id: &str,
        limit: u64,
    ) -> DbResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT project_name FROM agent_recent_projects WHERE agent_id = ?1 ORDER BY last_seen DESC LIMIT ?2",
        )
        .bind(agent_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}
