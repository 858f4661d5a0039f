// crates/db/src/lib.rs
// SQLite mirror for the activity ledger. The Markdown files are the
// source of truth; this mirror is the source of truth for queries and
// cross-project search, and a mirror failure never fails a primary write.
#![allow(clippy::too_many_arguments)]

mod migrations;
pub mod queries;
pub mod registry;

pub use queries::doc_changes::DocChangeRow;
pub use queries::entries::{EntryFilters, EntryRow};
pub use queries::projects::{MetricsRow, ProjectRow};
pub use queries::rotations::RotationRow;
pub use queries::sessions::SessionRow;
pub use registry::{ActivityInfo, DocsInfo, ProjectRegistry, ProjectView, StalenessLevel};

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(#[from] std::io::Error),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Main database handle wrapping a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn new(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            db_path: path.to_owned(),
        };
        db.run_migrations().await?;

        info!("Ledger mirror opened at {}", path.display());
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    ///
    /// `shared_cache(true)` makes all pool connections see the same
    /// in-memory database; without it each connection gets its own.
    pub async fn new_in_memory() -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .shared_cache(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let db = Self {
            pool,
            db_path: PathBuf::new(),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all inline migrations.
    ///
    /// A `_migrations` table tracks applied versions so non-idempotent
    /// statements (ALTER TABLE ADD COLUMN) only ever run once.
    async fn run_migrations(&self) -> DbResult<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM _migrations")
            .fetch_one(&self.pool)
            .await?;
        let current_version = row.0 as usize;

        for (i, migration) in migrations::MIGRATIONS.iter().enumerate() {
            let version = i + 1;
            if version > current_version {
                sqlx::query(migration).execute(&self.pool).await?;
                sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
                    .bind(version as i64)
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Path of the database file; empty for in-memory databases.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_database_runs_migrations() {
        let db = Database::new_in_memory().await.expect("open in-memory db");

        for table in [
            "scribe_projects",
            "scribe_metrics",
            "scribe_entries",
            "dev_plans",
            "phases",
            "doc_changes",
            "sessions",
            "agent_recent_projects",
            "rotation_history",
        ] {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db.pool())
                .await
                .unwrap_or_else(|_| panic!("{table} table should exist"));
            assert_eq!(count.0, 0);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = Database::new_in_memory().await.expect("first open");
        db.run_migrations().await.expect("second run succeeds");
    }

    #[tokio::test]
    async fn file_based_database_is_created() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let db_path = tmp.path().join(".scribe/state.sqlite");

        let db = Database::new(&db_path).await.expect("file-based db");
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scribe_projects")
            .fetch_one(db.pool())
            .await
            .expect("scribe_projects exists");
        assert_eq!(count.0, 0);
        assert!(db_path.exists());
    }
}
