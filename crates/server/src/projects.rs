// crates/server/src/projects.rs
// Project context resolution and the project lifecycle tools
// (set_project, get_project, list_projects, delete_project,
// generate_doc_templates).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use scribe_core::config::Settings;
use scribe_core::slug::{project_slug, repo_slug};

use crate::error::{ToolError, ToolResult};
use crate::response::ToolResponse;
use crate::state::AppState;

/// Document keys every project carries, with their canonical file names.
pub const DOC_FILES: [(&str, &str); 7] = [
    ("architecture", "ARCHITECTURE_GUIDE.md"),
    ("phase_plan", "PHASE_PLAN.md"),
    ("checklist", "CHECKLIST.md"),
    ("progress_log", "PROGRESS_LOG.md"),
    ("doc_log", "DOC_LOG.md"),
    ("security_log", "SECURITY_LOG.md"),
    ("bug_log", "BUG_LOG.md"),
];

/// A resolved project with its on-disk layout.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub name: String,
    pub slug: String,
    pub repo_slug: String,
    pub root: PathBuf,
    /// `docs/dev_plans/<slug>/` (or the legacy `.scribe/` tree).
    pub dir: PathBuf,
    pub docs: BTreeMap<String, PathBuf>,
}

impl ProjectContext {
    pub fn doc_path(&self, key: &str) -> Option<&PathBuf> {
        self.docs.get(key)
    }

    /// All three core docs exist on disk.
    pub fn core_docs_present(&self) -> bool {
        ["architecture", "phase_plan", "checklist"]
            .iter()
            .all(|key| self.docs.get(*key).map(|p| p.exists()).unwrap_or(false))
    }
}

/// Build the on-disk context for a project name.
pub fn project_context(settings: &Settings, name: &str) -> ProjectContext {
    let slug = project_slug(name);
    let dir = settings.dev_plans_root().join(&slug);
    let docs = DOC_FILES
        .iter()
        .map(|(key, file)| (key.to_string(), dir.join(file)))
        .collect();
    ProjectContext {
        name: name.to_string(),
        slug,
        repo_slug: repo_slug(&settings.repo_root),
        root: settings.repo_root.clone(),
        dir,
        docs,
    }
}

/// Resolve the active project: explicit name, then agent scope, then
/// session scope, then the state's current project, then the most recent
/// registered project.
pub async fn resolve_project(
    app: &AppState,
    explicit: Option<&str>,
    agent_id: Option<&str>,
    session_id: Option<&str>,
    require: bool,
) -> ToolResult<Option<ProjectContext>> {
    let snapshot = app.state.snapshot().await;
    let recent = snapshot.recent_projects.clone();

    let mut candidate: Option<String> = None;
    if let Some(name) = explicit {
        let name = name.trim();
        if !name.is_empty() {
            if app.db.get_project_row(name).await?.is_none() {
                return Err(ToolError::ProjectResolution {
                    recent_projects: recent,
                });
            }
            candidate = Some(name.to_string());
        }
    }
    if candidate.is_none() {
        if let Some(agent_id) = agent_id {
            candidate = app
                .state
                .agent_project(agent_id)
                .await
                .map(|ctx| ctx.current_project);
        }
    }
    if candidate.is_none() {
        if let Some(session_id) = session_id {
            candidate = app
                .state
                .session(session_id)
                .await
                .and_then(|s| s.project_name);
        }
    }
    if candidate.is_none() {
        candidate = snapshot.current_project.clone();
    }
    if candidate.is_none() {
        // Last resort: most recently used registered project.
        for name in &recent {
            if app.db.get_project_row(name).await?.is_some() {
                candidate = Some(name.clone());
                break;
            }
        }
    }

    match candidate {
        Some(name) => Ok(Some(project_context(&app.settings, &name))),
        None if require => Err(ToolError::ProjectResolution {
            recent_projects: recent,
        }),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tool requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub expected_version: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Scaffold the three core docs from templates when missing.
    #[serde(default)]
    pub create_docs: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetProjectRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteProjectRequest {
    pub name: String,
    /// `archive` (default) keeps rows out of active views; `permanent`
    /// removes every mirrored row. Files on disk are never deleted.
    #[serde(default)]
    pub mode: Option<String>,
}

// ---------------------------------------------------------------------------
// Tool handlers
// ---------------------------------------------------------------------------

/// set_project: idempotent create + bind as the active project.
pub async fn set_project(app: &AppState, req: SetProjectRequest) -> ToolResult<ToolResponse> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ToolError::InvalidParameter {
            field: "name".into(),
            message: "project name must be non-empty".into(),
        });
    }

    let context = project_context(&app.settings, &name);
    let progress_log = context
        .doc_path("progress_log")
        .expect("progress_log is always mapped")
        .display()
        .to_string();

    let view = app
        .registry
        .ensure_project(
            &name,
            &app.settings.repo_root.display().to_string(),
            &progress_log,
            req.description.as_deref(),
        )
        .await?;
    if !req.tags.is_empty() {
        app.db.set_project_tags(&name, &req.tags).await?;
    }

    app.state.set_current_project(&name).await?;
    let mut version = None;
    if let Some(agent_id) = req.agent_id.as_deref() {
        version = Some(
            app.state
                .set_agent_project(
                    agent_id,
                    &name,
                    req.expected_version,
                    "set_project",
                    req.session_id.as_deref(),
                )
                .await?,
        );
        if let Err(e) = app.db.touch_agent_recent(agent_id, &name).await {
            warn!(error = %e, "agent recency update failed");
        }
    }
    if let Some(session_id) = req.session_id.as_deref() {
        app.state
            .bind_session(session_id, "project", Some(&name), req.agent_id.as_deref())
            .await?;
        let session_row = scribe_db::SessionRow {
            session_id: session_id.to_string(),
            transport_session_id: None,
            agent_id: req.agent_id.clone(),
            repo_root: app.settings.repo_root.display().to_string(),
            mode: "project".into(),
            project_name: Some(name.clone()),
        };
        if let Err(e) = app.db.upsert_session(&session_row).await {
            warn!(error = %e, "session mirror upsert failed");
        }
    }
    app.registry.touch_access(&name).await?;

    let mut response = ToolResponse::ok()
        .field("project", serde_json::to_value(&view).unwrap_or_default())
        .field("path", context.dir.display().to_string());
    if let Some(version) = version {
        response.set_field("version", version);
    }

    if req.create_docs {
        let scaffolded = scaffold_core_docs(app, &context).await?;
        response.set_field("docs_created", json!(scaffolded));
    }

    let snapshot = app.state.snapshot().await;
    response.set_field("recent_projects", json!(snapshot.recent_projects));
    info!(project = %name, "set_project bound");
    Ok(response)
}

/// generate_doc_templates: scaffold missing core docs from templates.
pub async fn scaffold_core_docs(
    app: &AppState,
    context: &ProjectContext,
) -> ToolResult<Vec<String>> {
    let mut created = Vec::new();
    let titles = [
        ("architecture", "Architecture Guide"),
        ("phase_plan", "Phase Plan"),
        ("checklist", "Checklist"),
    ];
    for (key, title) in titles {
        let path = context.doc_path(key).expect("core docs are always mapped");
        if path.exists() {
            continue;
        }
        let body = format!(
            "# {title}: {name}\n\n<!-- ID: overview -->\n## Overview\n\n_Pending._\n",
            name = context.name
        );
        scribe_core::atomic::atomic_write(path, &body).await?;
        app.registry
            .record_doc_update(
                &context.name,
                key,
                &path.display().to_string(),
                &scribe_core::integrity::sha256_hex(body.as_bytes()),
            )
            .await?;
        created.push(key.to_string());
    }
    Ok(created)
}

/// get_project: view with computed registry fields.
pub async fn get_project(app: &AppState, req: GetProjectRequest) -> ToolResult<ToolResponse> {
    let context = resolve_project(
        app,
        req.name.as_deref(),
        req.agent_id.as_deref(),
        req.session_id.as_deref(),
        true,
    )
    .await?
    .expect("require=true never yields None");

    let view = match app.registry.get_project(&context.name).await? {
        Some(view) => view,
        None => {
            return Err(ToolError::ProjectResolution {
                recent_projects: app.state.snapshot().await.recent_projects,
            });
        }
    };
    app.registry.touch_access(&context.name).await?;

    Ok(ToolResponse::ok()
        .field("project", serde_json::to_value(&view).unwrap_or_default())
        .field("path", context.dir.display().to_string())
        .field(
            "core_docs_present",
            json!(context.core_docs_present()),
        ))
}

/// list_projects: all views, most active first.
pub async fn list_projects(app: &AppState) -> ToolResult<ToolResponse> {
    let mut views = app.registry.list_projects().await?;
    views.sort_by(|a, b| {
        b.activity
            .activity_score
            .partial_cmp(&a.activity.activity_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let count = views.len();
    Ok(ToolResponse::ok()
        .field("projects", serde_json::to_value(&views).unwrap_or_default())
        .field("count", count as u64))
}

/// delete_project: archive (default) or permanent removal of mirror rows.
pub async fn delete_project(app: &AppState, req: DeleteProjectRequest) -> ToolResult<ToolResponse> {
    let name = req.name.trim().to_string();
    let mode = req.mode.as_deref().unwrap_or("archive").to_ascii_lowercase();

    if app.db.get_project_row(&name).await?.is_none() {
        return Err(ToolError::ProjectResolution {
            recent_projects: app.state.snapshot().await.recent_projects,
        });
    }

    let mut response = ToolResponse::ok().field("project", name.clone());
    match mode.as_str() {
        "permanent" => {
            let deleted = app.db.delete_project(&name).await?;
            response.set_field("deleted", json!(deleted > 0));
            response.set_field("mode", "permanent");
        }
        _ => {
            app.db.set_project_status(&name, "archived").await?;
            response.set_field("mode", "archive");
        }
    }
    app.state.forget_project(&name).await?;
    info!(project = %name, mode = %mode, "delete_project");
    Ok(response)
}
