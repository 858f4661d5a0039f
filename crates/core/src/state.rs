// crates/core/src/state.rs
// Process-scoped state manager: a JSON snapshot persisted on every
// mutation. Holds the active-project context (per agent, with optimistic
// versioning), recency lists, per-file stats for the estimator, and the
// per-project rotation hash chains.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::atomic::atomic_write;
use crate::error::StateError;
use crate::estimator::CachedStats;

const RECENT_PROJECTS_CAP: usize = 10;
const RECENT_TOOLS_CAP: usize = 20;

/// Agent-scoped active project with optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub current_project: String,
    pub version: u64,
    pub updated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Cached stats for one `(project, log_type)` log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    pub size_bytes: u64,
    pub line_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_bytes_per_line: Option<f64>,
    pub mtime_ns: i128,
    pub inode: u64,
    /// How the line count was obtained (`precise`, `estimate`, `template`).
    pub source: String,
    pub initialized: bool,
}

impl FileStats {
    pub fn as_cached(&self) -> CachedStats {
        CachedStats {
            size_bytes: self.size_bytes,
            mtime_ns: self.mtime_ns,
            line_count: self.line_count,
            ema_bytes_per_line: self.ema_bytes_per_line,
        }
    }
}

/// Tamper-evident rotation chain anchor for one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HashChain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<String>,
    #[serde(default)]
    pub last_sequence: u64,
}

/// Session binding (transport session → mode + project).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// The serialized snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_project: Option<String>,
    #[serde(default)]
    pub agent_contexts: BTreeMap<String, AgentContext>,
    #[serde(default)]
    pub recent_projects: Vec<String>,
    #[serde(default)]
    pub recent_tools: Vec<String>,
    /// Keyed `"{project}::{log_type}"`.
    #[serde(default)]
    pub file_stats: BTreeMap<String, FileStats>,
    #[serde(default)]
    pub hash_chains: BTreeMap<String, HashChain>,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionState>,
}

fn stats_key(project: &str, log_type: &str) -> String {
    format!("{project}::{log_type}")
}

/// Mutex-guarded state with JSON persistence on each mutation.
#[derive(Debug)]
pub struct StateManager {
    path: PathBuf,
    inner: Mutex<StateSnapshot>,
}

impl StateManager {
    /// Load the snapshot at `path`, starting fresh (and preserving the
    /// corrupt file as `.corrupt.bak`) when it cannot be parsed.
    pub async fn load(path: &Path) -> Self {
        let snapshot = match tokio::fs::read_to_string(path).await {
            Ok(raw) => match serde_json::from_str::<StateSnapshot>(&raw) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt state snapshot; starting fresh");
                    let backup = crate::atomic::sibling_with_suffix(path, ".corrupt.bak");
                    let _ = tokio::fs::copy(path, backup).await;
                    StateSnapshot::default()
                }
            },
            Err(_) => StateSnapshot::default(),
        };
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(snapshot),
        }
    }

    /// In-memory manager for tests.
    pub fn in_memory(dir: &Path) -> Self {
        Self {
            path: dir.join("state.json"),
            inner: Mutex::new(StateSnapshot::default()),
        }
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().await.clone()
    }

    async fn persist(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        let encoded = serde_json::to_string_pretty(snapshot).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        atomic_write(&self.path, &encoded)
            .await
            .map_err(|e| StateError::Persist {
                path: self.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })
    }

    /// Set the session-level current project and front the recents list.
    pub async fn set_current_project(&self, name: &str) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        state.current_project = Some(name.to_string());
        front_dedup(&mut state.recent_projects, name, RECENT_PROJECTS_CAP);
        self.persist(&state).await
    }

    /// Set an agent's current project with optimistic versioning.
    ///
    /// `expected_version` of `None` skips the check (first bind or forced
    /// update); a mismatch returns `VersionConflict` without mutating.
    pub async fn set_agent_project(
        &self,
        agent_id: &str,
        project: &str,
        expected_version: Option<u64>,
        updated_by: &str,
        session_id: Option<&str>,
    ) -> Result<u64, StateError> {
        let mut state = self.inner.lock().await;
        let current_version = state
            .agent_contexts
            .get(agent_id)
            .map(|c| c.version)
            .unwrap_or(0);
        if let Some(expected) = expected_version {
            if expected != current_version {
                return Err(StateError::VersionConflict {
                    expected,
                    actual: current_version,
                });
            }
        }
        let next_version = current_version + 1;
        state.agent_contexts.insert(
            agent_id.to_string(),
            AgentContext {
                current_project: project.to_string(),
                version: next_version,
                updated_by: updated_by.to_string(),
                session_id: session_id.map(|s| s.to_string()),
            },
        );
        front_dedup(&mut state.recent_projects, project, RECENT_PROJECTS_CAP);
        self.persist(&state).await?;
        Ok(next_version)
    }

    pub async fn agent_project(&self, agent_id: &str) -> Option<AgentContext> {
        self.inner.lock().await.agent_contexts.get(agent_id).cloned()
    }

    /// Record a tool invocation and return a snapshot.
    pub async fn record_tool(&self, tool_name: &str) -> StateSnapshot {
        let mut state = self.inner.lock().await;
        front_dedup(&mut state.recent_tools, tool_name, RECENT_TOOLS_CAP);
        if let Err(e) = self.persist(&state).await {
            warn!(error = %e, "failed to persist recent-tools update");
        }
        state.clone()
    }

    pub async fn file_stats(&self, project: &str, log_type: &str) -> Option<FileStats> {
        self.inner
            .lock()
            .await
            .file_stats
            .get(&stats_key(project, log_type))
            .cloned()
    }

    pub async fn update_file_stats(
        &self,
        project: &str,
        log_type: &str,
        stats: FileStats,
    ) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        state.file_stats.insert(stats_key(project, log_type), stats);
        self.persist(&state).await
    }

    pub async fn hash_chain(&self, project: &str) -> HashChain {
        self.inner
            .lock()
            .await
            .hash_chains
            .get(project)
            .cloned()
            .unwrap_or_default()
    }

    /// Reserve the next rotation sequence number. The increment persists
    /// immediately so a crashed rotation can never reuse the number.
    pub async fn reserve_sequence(&self, project: &str) -> Result<u64, StateError> {
        let mut state = self.inner.lock().await;
        let chain = state.hash_chains.entry(project.to_string()).or_default();
        chain.last_sequence += 1;
        let reserved = chain.last_sequence;
        self.persist(&state).await?;
        Ok(reserved)
    }

    /// Commit a completed rotation into the chain:
    /// `root ← SHA-256(prev_root || archive_sha)` with the empty string as
    /// the genesis prior root.
    pub async fn commit_rotation(
        &self,
        project: &str,
        archive_sha256: &str,
    ) -> Result<HashChain, StateError> {
        let mut state = self.inner.lock().await;
        let chain = state.hash_chains.entry(project.to_string()).or_default();
        let prior_root = chain.root_hash.clone().unwrap_or_default();
        let root_input = format!("{prior_root}{archive_sha256}");
        chain.root_hash = Some(crate::integrity::sha256_hex(root_input.as_bytes()));
        chain.last_hash = Some(archive_sha256.to_string());
        let updated = chain.clone();
        self.persist(&state).await?;
        Ok(updated)
    }

    pub async fn bind_session(
        &self,
        session_id: &str,
        mode: &str,
        project_name: Option<&str>,
        agent_id: Option<&str>,
    ) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        state.sessions.insert(
            session_id.to_string(),
            SessionState {
                mode: mode.to_string(),
                project_name: project_name.map(|s| s.to_string()),
                agent_id: agent_id.map(|s| s.to_string()),
            },
        );
        self.persist(&state).await
    }

    pub async fn session(&self, session_id: &str) -> Option<SessionState> {
        self.inner.lock().await.sessions.get(session_id).cloned()
    }

    /// Drop a project from every view of the state (used by delete_project).
    pub async fn forget_project(&self, name: &str) -> Result<(), StateError> {
        let mut state = self.inner.lock().await;
        if state.current_project.as_deref() == Some(name) {
            state.current_project = None;
        }
        state.recent_projects.retain(|p| p != name);
        state.agent_contexts.retain(|_, c| c.current_project != name);
        let prefix = format!("{name}::");
        state.file_stats.retain(|k, _| !k.starts_with(&prefix));
        state.hash_chains.remove(name);
        self.persist(&state).await
    }
}

fn front_dedup(list: &mut Vec<String>, value: &str, cap: usize) {
    list.retain(|v| v != value);
    list.insert(0, value.to_string());
    list.truncate(cap);
}
