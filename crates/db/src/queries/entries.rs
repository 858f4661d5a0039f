// crates/db/src/queries/entries.rs
// Entry mirror: inserts and the paginated, filter-pushdown reads that back
// the query engine. SQL-expressible filters (agent, emoji, time, log type,
// message substring) push down; JSON-dependent filters (meta equality,
// priority, category, min_confidence) are applied application-side over
// the decoded rows.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite};

use crate::{Database, DbResult};

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct EntryRow {
    pub entry_id: String,
    pub project_id: i64,
    /// RFC 3339 `Z` timestamp (see `queries::encode_ts`).
    pub ts: String,
    pub emoji: String,
    pub agent: String,
    pub message: String,
    /// JSON object as text.
    pub meta: String,
    pub raw_line: String,
    pub sha256: String,
    pub log_type: String,
}

impl EntryRow {
    pub fn meta_map(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str::<serde_json::Value>(&self.meta)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }
}

/// Filters pushed into entry reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryFilters {
    pub agents: Vec<String>,
    pub emojis: Vec<String>,
    pub log_types: Vec<String>,
    /// Case-insensitive substring over the message column.
    pub message_substring: Option<String>,
    /// Inclusive bounds in the stored text encoding.
    pub ts_start: Option<String>,
    pub ts_end: Option<String>,
    /// Application-side: every pair must equal the stringified meta value.
    pub meta_equals: Vec<(String, String)>,
    pub priority: Vec<String>,
    pub category: Vec<String>,
    pub min_confidence: Option<f64>,
}

impl EntryFilters {
    fn has_app_side(&self) -> bool {
        !self.meta_equals.is_empty()
            || !self.priority.is_empty()
            || !self.category.is_empty()
            || self.min_confidence.is_some()
    }

    /// Apply the application-side (meta-dependent) filters.
    pub fn matches_meta(&self, row: &EntryRow) -> bool {
        let meta = row.meta_map();
        let stringify = |v: &serde_json::Value| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        for (key, expected) in &self.meta_equals {
            match meta.get(key) {
                Some(value) if stringify(value) == *expected => {}
                _ => return false,
            }
        }
        if !self.priority.is_empty() {
            let Some(value) = meta.get("priority").map(&stringify) else {
                return false;
            };
            if !self.priority.iter().any(|p| p.eq_ignore_ascii_case(&value)) {
                return false;
            }
        }
        if !self.category.is_empty() {
            let Some(value) = meta.get("category").map(&stringify) else {
                return false;
            };
            if !self.category.iter().any(|c| c.eq_ignore_ascii_case(&value)) {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            let confidence = meta
                .get("confidence")
                .and_then(|v| match v {
                    serde_json::Value::Number(n) => n.as_f64(),
                    serde_json::Value::String(s) => s.parse().ok(),
                    _ => None,
                })
                .unwrap_or(0.0);
            if confidence < min {
                return false;
            }
        }
        true
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, project_id: i64, filters: &EntryFilters) {
    builder.push(" WHERE project_id = ").push_bind(project_id);

    if !filters.agents.is_empty() {
        builder.push(" AND agent IN (");
        let mut separated = builder.separated(", ");
        for agent in &filters.agents {
            separated.push_bind(agent.clone());
        }
        separated.push_unseparated(")");
    }
    if !filters.emojis.is_empty() {
        builder.push(" AND emoji IN (");
        let mut separated = builder.separated(", ");
        for emoji in &filters.emojis {
            separated.push_bind(emoji.clone());
        }
        separated.push_unseparated(")");
    }
    if !filters.log_types.is_empty() {
        builder.push(" AND log_type IN (");
        let mut separated = builder.separated(", ");
        for log_type in &filters.log_types {
            separated.push_bind(log_type.clone());
        }
        separated.push_unseparated(")");
    }
    if let Some(substring) = &filters.message_substring {
        builder
            .push(" AND LOWER(message) LIKE ")
            .push_bind(format!("%{}%", substring.to_lowercase()));
    }
    if let Some(start) = &filters.ts_start {
        builder.push(" AND ts >= ").push_bind(start.clone());
    }
    if let Some(end) = &filters.ts_end {
        builder.push(" AND ts <= ").push_bind(end.clone());
    }
}

impl Database {
    /// Mirror one appended entry. `INSERT OR IGNORE`: replays of the same
    /// deterministic id must not duplicate or error.
    pub async fn insert_entry(&self, entry: &EntryRow) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO scribe_entries
                (entry_id, project_id, ts, emoji, agent, message, meta, raw_line, sha256, log_type)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&entry.entry_id)
        .bind(entry.project_id)
        .bind(&entry.ts)
        .bind(&entry.emoji)
        .bind(&entry.agent)
        .bind(&entry.message)
        .bind(&entry.meta)
        .bind(&entry.raw_line)
        .bind(&entry.sha256)
        .bind(&entry.log_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one page of entries, newest first.
    ///
    /// `page` is 1-based. When application-side filters are present the
    /// pagination happens after those filters, so page boundaries stay
    /// consistent with `count_entries`.
    pub async fn fetch_recent_entries_paginated(
        &self,
        project_id: i64,
        page: u64,
        page_size: u64,
        filters: &EntryFilters,
    ) -> DbResult<Vec<EntryRow>> {
        let page = page.max(1);
        let offset = (page - 1) * page_size;

        if filters.has_app_side() {
            let all = self.fetch_filtered(project_id, filters, None).await?;
            return Ok(all
                .into_iter()
                .skip(offset as usize)
                .take(page_size as usize)
                .collect());
        }

        let mut builder = QueryBuilder::new("SELECT * FROM scribe_entries");
        push_filters(&mut builder, project_id, filters);
        builder.push(" ORDER BY ts DESC, entry_id DESC");
        builder.push(" LIMIT ").push_bind(page_size as i64);
        builder.push(" OFFSET ").push_bind(offset as i64);

        let rows = builder
            .build_query_as::<EntryRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Count entries matching the filters.
    pub async fn count_entries(&self, project_id: i64, filters: &EntryFilters) -> DbResult<u64> {
        if filters.has_app_side() {
            let all = self.fetch_filtered(project_id, filters, None).await?;
            return Ok(all.len() as u64);
        }
        let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM scribe_entries");
        push_filters(&mut builder, project_id, filters);
        let count: (i64,) = builder.build_query_as().fetch_one(&self.pool).await?;
        Ok(count.0 as u64)
    }

    /// Fetch all SQL-matching rows, then apply meta filters in order.
    async fn fetch_filtered(
        &self,
        project_id: i64,
        filters: &EntryFilters,
        limit: Option<u64>,
    ) -> DbResult<Vec<EntryRow>> {
        let mut builder = QueryBuilder::new("SELECT * FROM scribe_entries");
        push_filters(&mut builder, project_id, filters);
        builder.push(" ORDER BY ts DESC, entry_id DESC");
        if let Some(limit) = limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows = builder
            .build_query_as::<EntryRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().filter(|r| filters.matches_meta(r)).collect())
    }

    /// Whether any entries are mirrored for a project (used to pick the
    /// file-scan fallback in the query engine).
    pub async fn has_entries(&self, project_id: i64) -> DbResult<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM scribe_entries WHERE project_id = ?1 LIMIT 1")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 > 0)
    }

    pub async fn get_entry(&self, entry_id: &str) -> DbResult<Option<EntryRow>> {
        let row = sqlx::query_as::<_, EntryRow>(
            "SELECT * FROM scribe_entries WHERE entry_id = ?1",
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
