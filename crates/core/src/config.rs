// crates/core/src/config.rs
// Runtime settings and the per-log-type table. Everything here is loaded
// once at server start; environment variables with the `SCRIBE_` prefix
// override file/CLI values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default rotation threshold when a log type does not declare one.
pub const DEFAULT_ROTATION_THRESHOLD: u64 = 500;

/// Relative location of the global progress log.
pub const GLOBAL_PROGRESS_LOG: &str = "docs/GLOBAL_PROGRESS_LOG.md";

/// Per-log-type configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogTypeConfig {
    pub name: String,
    /// File name inside the project's dev-plans directory.
    pub file_name: String,
    /// Metadata keys an entry of this type must carry.
    pub metadata_requirements: Vec<String>,
    pub rotation_threshold_entries: u64,
    pub template_name: String,
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub repo_root: PathBuf,
    pub db_path: PathBuf,
    pub state_path: PathBuf,
    /// Appends allowed per project per rolling window; 0 disables limiting.
    pub log_rate_limit_count: u32,
    /// Rolling window length in seconds.
    pub log_rate_limit_window: u64,
    /// Auto-rotation size threshold in bytes; 0 disables.
    pub log_max_bytes: u64,
    /// Timeout for each SQLite round-trip.
    pub storage_timeout_seconds: u64,
    // Token budgets consumed by the response-optimizer collaborator.
    pub token_daily_limit: u64,
    pub token_operation_limit: u64,
    pub token_warning_threshold: f64,
    /// Optional change-event endpoint for the vector-indexer sidecar.
    pub indexer_endpoint: Option<String>,
    /// Log-type table, keyed by type name.
    pub log_types: BTreeMap<String, LogTypeConfig>,
}

impl Settings {
    /// Build settings for `repo_root` with defaults, then apply `SCRIBE_*`
    /// environment overrides.
    pub fn load(repo_root: &Path) -> Self {
        let mut settings = Self::defaults(repo_root);
        settings.apply_env_overrides();
        settings
    }

    pub fn defaults(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            db_path: repo_root.join(".scribe/state.sqlite"),
            state_path: repo_root.join(".scribe/state.json"),
            log_rate_limit_count: 20,
            log_rate_limit_window: 60,
            log_max_bytes: 1024 * 1024,
            storage_timeout_seconds: 5,
            token_daily_limit: 500_000,
            token_operation_limit: 25_000,
            token_warning_threshold: 0.8,
            indexer_endpoint: None,
            log_types: default_log_types(),
        }
    }

    fn apply_env_overrides(&mut self) {
        read_env_u32("SCRIBE_LOG_RATE_LIMIT_COUNT", &mut self.log_rate_limit_count);
        read_env_u64("SCRIBE_LOG_RATE_LIMIT_WINDOW", &mut self.log_rate_limit_window);
        read_env_u64("SCRIBE_LOG_MAX_BYTES", &mut self.log_max_bytes);
        read_env_u64(
            "SCRIBE_STORAGE_TIMEOUT_SECONDS",
            &mut self.storage_timeout_seconds,
        );
        read_env_u64("SCRIBE_TOKEN_DAILY_LIMIT", &mut self.token_daily_limit);
        read_env_u64(
            "SCRIBE_TOKEN_OPERATION_LIMIT",
            &mut self.token_operation_limit,
        );
        if let Ok(raw) = std::env::var("SCRIBE_TOKEN_WARNING_THRESHOLD") {
            match raw.parse::<f64>() {
                Ok(v) if (0.0..=1.0).contains(&v) => self.token_warning_threshold = v,
                _ => warn!(value = %raw, "ignoring invalid SCRIBE_TOKEN_WARNING_THRESHOLD"),
            }
        }
        if let Ok(raw) = std::env::var("SCRIBE_DB_PATH") {
            self.db_path = self.repo_root.join(raw);
        }
        if let Ok(raw) = std::env::var("SCRIBE_STATE_PATH") {
            self.state_path = self.repo_root.join(raw);
        }
        if let Ok(raw) = std::env::var("SCRIBE_INDEXER_ENDPOINT") {
            if !raw.trim().is_empty() {
                self.indexer_endpoint = Some(raw);
            }
        }
    }

    /// Look up a log type, falling back to a generic definition named
    /// after the type (`<NAME>_LOG.md`, no metadata requirements).
    pub fn log_type(&self, name: &str) -> LogTypeConfig {
        let key = name.trim().to_ascii_lowercase();
        let key = if key.is_empty() { "progress".to_string() } else { key };
        self.log_types.get(&key).cloned().unwrap_or_else(|| {
            let upper = key.to_ascii_uppercase();
            LogTypeConfig {
                name: key,
                file_name: format!("{upper}_LOG.md"),
                metadata_requirements: Vec::new(),
                rotation_threshold_entries: DEFAULT_ROTATION_THRESHOLD,
                template_name: "log_header".to_string(),
            }
        })
    }

    /// Dev-plans directory for the repository: `docs/dev_plans/` unless a
    /// legacy `.scribe/docs/dev_plans/` tree already exists.
    pub fn dev_plans_root(&self) -> PathBuf {
        let legacy = self.repo_root.join(".scribe/docs/dev_plans");
        let primary = self.repo_root.join("docs/dev_plans");
        if !primary.exists() && legacy.exists() {
            legacy
        } else {
            primary
        }
    }

    /// Absolute path of the global progress log.
    pub fn global_progress_log(&self) -> PathBuf {
        self.repo_root.join(GLOBAL_PROGRESS_LOG)
    }
}

fn read_env_u32(key: &str, slot: &mut u32) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var = key, value = %raw, "ignoring unparseable environment override"),
        }
    }
}

fn read_env_u64(key: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var = key, value = %raw, "ignoring unparseable environment override"),
        }
    }
}

fn default_log_types() -> BTreeMap<String, LogTypeConfig> {
    let defs = [
        LogTypeConfig {
            name: "progress".into(),
            file_name: "PROGRESS_LOG.md".into(),
            metadata_requirements: vec![],
            rotation_threshold_entries: DEFAULT_ROTATION_THRESHOLD,
            template_name: "progress_log".into(),
        },
        LogTypeConfig {
            name: "doc_updates".into(),
            file_name: "DOC_LOG.md".into(),
            metadata_requirements: vec!["doc".into(), "action".into()],
            rotation_threshold_entries: DEFAULT_ROTATION_THRESHOLD,
            template_name: "doc_log".into(),
        },
        LogTypeConfig {
            name: "security".into(),
            file_name: "SECURITY_LOG.md".into(),
            metadata_requirements: vec!["severity".into(), "component".into()],
            rotation_threshold_entries: DEFAULT_ROTATION_THRESHOLD,
            template_name: "security_log".into(),
        },
        LogTypeConfig {
            name: "bugs".into(),
            file_name: "BUG_LOG.md".into(),
            metadata_requirements: vec!["severity".into(), "component".into(), "status".into()],
            rotation_threshold_entries: DEFAULT_ROTATION_THRESHOLD,
            template_name: "bug_log".into(),
        },
    ];
    defs.into_iter().map(|d| (d.name.clone(), d)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn defaults_have_all_core_log_types() {
        let dir = tempdir().unwrap();
        let settings = Settings::defaults(dir.path());
        for name in ["progress", "doc_updates", "security", "bugs"] {
            assert!(settings.log_types.contains_key(name), "missing {name}");
        }
        assert_eq!(
            settings.log_type("bugs").metadata_requirements,
            vec!["severity", "component", "status"]
        );
    }

    #[test]
    fn unknown_log_type_gets_generic_definition() {
        let dir = tempdir().unwrap();
        let settings = Settings::defaults(dir.path());
        let research = settings.log_type("research");
        assert_eq!(research.file_name, "RESEARCH_LOG.md");
        assert!(research.metadata_requirements.is_empty());
        assert_eq!(
            research.rotation_threshold_entries,
            DEFAULT_ROTATION_THRESHOLD
        );
    }

    #[test]
    fn empty_log_type_falls_back_to_progress() {
        let dir = tempdir().unwrap();
        let settings = Settings::defaults(dir.path());
        assert_eq!(settings.log_type("").name, "progress");
        assert_eq!(settings.log_type("  PROGRESS ").name, "progress");
    }

    #[test]
    fn dev_plans_prefers_primary_location() {
        let dir = tempdir().unwrap();
        let settings = Settings::defaults(dir.path());
        assert_eq!(
            settings.dev_plans_root(),
            dir.path().join("docs/dev_plans")
        );
    }

    #[test]
    fn dev_plans_falls_back_to_existing_legacy_tree() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".scribe/docs/dev_plans")).unwrap();
        let settings = Settings::defaults(dir.path());
        assert_eq!(
            settings.dev_plans_root(),
            dir.path().join(".scribe/docs/dev_plans")
        );
    }

    #[test]
    fn dev_plans_ignores_legacy_once_primary_exists() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".scribe/docs/dev_plans")).unwrap();
        std::fs::create_dir_all(dir.path().join("docs/dev_plans")).unwrap();
        let settings = Settings::defaults(dir.path());
        assert_eq!(
            settings.dev_plans_root(),
            dir.path().join("docs/dev_plans")
        );
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        let dir = tempdir().unwrap();
        std::env::set_var("SCRIBE_LOG_RATE_LIMIT_COUNT", "5");
        std::env::set_var("SCRIBE_LOG_MAX_BYTES", "2048");
        std::env::set_var("SCRIBE_DB_PATH", "custom/mirror.sqlite");

        let settings = Settings::load(dir.path());
        assert_eq!(settings.log_rate_limit_count, 5);
        assert_eq!(settings.log_max_bytes, 2048);
        assert_eq!(settings.db_path, dir.path().join("custom/mirror.sqlite"));

        std::env::remove_var("SCRIBE_LOG_RATE_LIMIT_COUNT");
        std::env::remove_var("SCRIBE_LOG_MAX_BYTES");
        std::env::remove_var("SCRIBE_DB_PATH");
    }

    #[test]
    #[serial]
    fn invalid_env_override_is_ignored() {
        let dir = tempdir().unwrap();
        std::env::set_var("SCRIBE_LOG_RATE_LIMIT_COUNT", "not-a-number");
        let settings = Settings::load(dir.path());
        assert_eq!(settings.log_rate_limit_count, 20);
        std::env::remove_var("SCRIBE_LOG_RATE_LIMIT_COUNT");
    }
}
