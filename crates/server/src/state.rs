// crates/server/src/state.rs
// Shared application state handed to every tool handler.

use std::sync::Arc;

use scribe_core::config::Settings;
use scribe_core::state::StateManager;
use scribe_core::template::{BuiltinTemplates, TemplateEngine};
use scribe_db::{Database, ProjectRegistry};

use crate::events::EventPublisher;
use crate::rate_limit::RateLimiter;

pub struct AppState {
    pub settings: Settings,
    pub db: Database,
    pub registry: ProjectRegistry,
    pub state: Arc<StateManager>,
    pub rate_limiter: RateLimiter,
    pub templates: Arc<dyn TemplateEngine>,
    pub events: EventPublisher,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(settings: Settings, db: Database, state: Arc<StateManager>) -> Self {
        let rate_limiter = RateLimiter::new(
            settings.log_rate_limit_count,
            settings.log_rate_limit_window,
        );
        let events = EventPublisher::new(settings.indexer_endpoint.clone());
        Self {
            registry: ProjectRegistry::new(db.clone()),
            rate_limiter,
            events,
            templates: Arc::new(BuiltinTemplates),
            settings,
            db,
            state,
        }
    }
}
