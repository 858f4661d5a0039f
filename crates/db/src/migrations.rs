/// Inline SQL migrations for the ledger mirror schema.
///
/// Simple inline migrations rather than sqlx migration files: the schema
/// is small and self-contained. SQL stays portable (no SQLite-specific
/// functions in hot paths; JSON columns are plain TEXT parsed
/// application-side) so the mirror can move to a server-class engine.
pub const MIGRATIONS: &[&str] = &[
    // Migration 1: projects
    r#"
CREATE TABLE IF NOT EXISTS scribe_projects (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    repo_root TEXT NOT NULL,
    progress_log_path TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'planning',
    created_at TEXT NOT NULL,
    last_entry_at TEXT,
    last_access_at TEXT,
    last_status_change TEXT,
    tags TEXT NOT NULL DEFAULT '',
    meta TEXT NOT NULL DEFAULT '{}'
);
"#,
    // Migration 2: per-project metrics
    r#"
CREATE TABLE IF NOT EXISTS scribe_metrics (
    project_id INTEGER PRIMARY KEY REFERENCES scribe_projects(id),
    total_entries INTEGER NOT NULL DEFAULT 0,
    progress_entries INTEGER NOT NULL DEFAULT 0,
    bug_entries INTEGER NOT NULL DEFAULT 0,
    security_entries INTEGER NOT NULL DEFAULT 0,
    doc_update_count INTEGER NOT NULL DEFAULT 0,
    last_doc_update_at TEXT
);
"#,
    // Migration 3: entries
    r#"
CREATE TABLE IF NOT EXISTS scribe_entries (
    entry_id TEXT PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES scribe_projects(id),
    ts TEXT NOT NULL,
    emoji TEXT NOT NULL,
    agent TEXT NOT NULL,
    message TEXT NOT NULL,
    meta TEXT NOT NULL DEFAULT '{}',
    raw_line TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    log_type TEXT NOT NULL DEFAULT 'progress'
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_entries_project_ts ON scribe_entries(project_id, ts DESC);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_entries_agent ON scribe_entries(agent);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_entries_log_type ON scribe_entries(project_id, log_type);"#,
    // Migration 4: dev plans + phases
    r#"
CREATE TABLE IF NOT EXISTS dev_plans (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES scribe_projects(id),
    plan_type TEXT NOT NULL,
    file_path TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    metadata TEXT NOT NULL DEFAULT '{}',
    UNIQUE(project_id, plan_type)
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS phases (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES scribe_projects(id),
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    position INTEGER NOT NULL DEFAULT 0,
    UNIQUE(project_id, name)
);
"#,
    // Migration 5: document change audit
    r#"
CREATE TABLE IF NOT EXISTS doc_changes (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES scribe_projects(id),
    doc TEXT NOT NULL,
    section TEXT,
    action TEXT NOT NULL,
    agent TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT '{}',
    sha_before TEXT,
    sha_after TEXT,
    ts TEXT NOT NULL
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_doc_changes_project ON doc_changes(project_id, ts DESC);"#,
    // Migration 6: sessions + agent recency
    r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    transport_session_id TEXT,
    agent_id TEXT,
    repo_root TEXT NOT NULL DEFAULT '',
    mode TEXT NOT NULL DEFAULT 'project',
    project_name TEXT
);
"#,
    r#"
CREATE TABLE IF NOT EXISTS agent_recent_projects (
    agent_id TEXT NOT NULL,
    project_name TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    PRIMARY KEY (agent_id, project_name)
);
"#,
    // Migration 7: rotation audit
    r#"
CREATE TABLE IF NOT EXISTS rotation_history (
    rotation_id TEXT PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES scribe_projects(id),
    log_type TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    previous_hash TEXT,
    archive_path TEXT NOT NULL,
    archive_sha256 TEXT,
    rotated_entry_count INTEGER NOT NULL DEFAULT 0,
    rotation_timestamp TEXT NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}'
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_rotation_project_seq ON rotation_history(project_id, sequence_number);"#,
];
