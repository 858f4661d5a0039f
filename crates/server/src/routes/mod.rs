// crates/server/src/routes/mod.rs
// The tool-RPC boundary: one POST route per tool, JSON in, `{ok: bool}`
// envelope out. Handlers stay thin; the engines live in the sibling
// modules.

use axum::{extract::State, routing::get, routing::post, Json, Router};
use serde_json::{json, Value};

use crate::append::{append_entry, AppendRequest};
use crate::docs::{manage_docs, ManageDocsRequest};
use crate::error::ToolError;
use crate::projects::{
    delete_project, get_project, list_projects, set_project, DeleteProjectRequest,
    GetProjectRequest, SetProjectRequest,
};
use crate::query::{query_entries, read_recent, QueryRequest, ReadRecentRequest};
use crate::rotation::{rotate_log, RotationRequest};
use crate::state::SharedState;

pub fn tool_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/tools/set_project", post(set_project_route))
        .route("/tools/get_project", post(get_project_route))
        .route("/tools/list_projects", post(list_projects_route))
        .route("/tools/delete_project", post(delete_project_route))
        .route("/tools/append_entry", post(append_entry_route))
        .route("/tools/rotate_log", post(rotate_log_route))
        .route("/tools/query_entries", post(query_entries_route))
        .route("/tools/read_recent", post(read_recent_route))
        .route("/tools/manage_docs", post(manage_docs_route))
}

async fn health(State(app): State<SharedState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "repo_root": app.settings.repo_root.display().to_string(),
        "db_path": app.db.db_path().display().to_string(),
    }))
}

/// Convert a handler result into the always-200 `{ok: bool}` envelope.
fn envelope(result: Result<crate::response::ToolResponse, ToolError>) -> Json<Value> {
    match result {
        Ok(response) => Json(response.into_value()),
        Err(e) => {
            tracing::warn!(code = e.code(), error = %e, "tool call failed");
            Json(e.to_payload())
        }
    }
}

async fn set_project_route(
    State(app): State<SharedState>,
    Json(req): Json<SetProjectRequest>,
) -> Json<Value> {
    envelope(set_project(&app, req).await)
}

async fn get_project_route(
    State(app): State<SharedState>,
    Json(req): Json<GetProjectRequest>,
) -> Json<Value> {
    envelope(get_project(&app, req).await)
}

async fn list_projects_route(State(app): State<SharedState>) -> Json<Value> {
    envelope(list_projects(&app).await)
}

async fn delete_project_route(
    State(app): State<SharedState>,
    Json(req): Json<DeleteProjectRequest>,
) -> Json<Value> {
    envelope(delete_project(&app, req).await)
}

async fn append_entry_route(
    State(app): State<SharedState>,
    Json(req): Json<AppendRequest>,
) -> Json<Value> {
    envelope(append_entry(&app, req).await)
}

async fn rotate_log_route(
    State(app): State<SharedState>,
    Json(req): Json<RotationRequest>,
) -> Json<Value> {
    envelope(rotate_log(&app, req).await)
}

async fn query_entries_route(
    State(app): State<SharedState>,
    Json(req): Json<QueryRequest>,
) -> Json<Value> {
    envelope(query_entries(&app, req).await)
}

async fn read_recent_route(
    State(app): State<SharedState>,
    Json(req): Json<ReadRecentRequest>,
) -> Json<Value> {
    envelope(read_recent(&app, req).await)
}

async fn manage_docs_route(
    State(app): State<SharedState>,
    Json(req): Json<ManageDocsRequest>,
) -> Json<Value> {
    envelope(manage_docs(&app, req).await)
}
