// crates/server/src/lib.rs
//! Scribe server library.
//!
//! The tool-RPC surface (axum JSON routes) plus the engines behind it:
//! the append pipeline, rotation engine, query engine, document manager,
//! project lifecycle tools, and the per-project rate limiter.

pub mod append;
pub mod docs;
pub mod error;
pub mod events;
pub mod projects;
pub mod query;
pub mod rate_limit;
pub mod response;
pub mod rotation;
pub mod routes;
pub mod state;

pub use error::{ToolError, ToolResult};
pub use response::ToolResponse;
pub use routes::tool_routes;
pub use state::{AppState, SharedState};

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use scribe_core::config::Settings;
use scribe_core::state::StateManager;
use scribe_db::Database;

/// Build the application: open the mirror, load state, replay any
/// uncommitted journal entries, and wire the routes.
pub async fn create_app(settings: Settings) -> anyhow::Result<(Router, SharedState)> {
    let db = Database::new(&settings.db_path).await?;
    let state = Arc::new(StateManager::load(&settings.state_path).await);
    let app_state: SharedState = Arc::new(AppState::new(settings, db, state));

    replay_journals(&app_state).await;

    let router = Router::new()
        .merge(routes::tool_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state.clone());
    Ok((router, app_state))
}

/// Startup recovery: scan every registered project's log files and replay
/// journaled appends that never committed.
async fn replay_journals(app: &SharedState) {
    let projects = match app.db.list_project_rows().await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "journal replay skipped: cannot list projects");
            return;
        }
    };
    for project in projects {
        let context = projects::project_context(&app.settings, &project.name);
        for path in context.docs.values() {
            match scribe_core::journal::replay_uncommitted(path).await {
                Ok(0) => {}
                Ok(replayed) => {
                    info!(path = %path.display(), replayed, "journal replay recovered entries");
                }
                Err(e) => {
                    // Per-entry replay failures are warnings, not fatal.
                    warn!(path = %path.display(), error = %e, "journal replay failed");
                }
            }
        }
    }
}
