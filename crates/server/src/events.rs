// crates/server/src/events.rs
// Fire-and-forget change events for the optional vector-indexer sidecar.
// No endpoint configured means no-op; a failing endpoint is logged and
// never affects the primary operation.

use serde_json::json;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct EventPublisher {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl EventPublisher {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    pub fn entry_created(&self, project: &str, entry_id: &str, log_type: &str) {
        self.post(json!({
            "event": "entry_created",
            "project": project,
            "entry_id": entry_id,
            "log_type": log_type,
        }));
    }

    pub fn doc_changed(&self, project: &str, doc: &str, action: &str, sha_after: Option<&str>) {
        self.post(json!({
            "event": "doc_changed",
            "project": project,
            "doc": doc,
            "action": action,
            "sha_after": sha_after,
        }));
    }

    fn post(&self, payload: serde_json::Value) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&endpoint).json(&payload).send().await {
                Ok(response) => {
                    debug!(status = %response.status(), "change event delivered");
                }
                Err(e) => {
                    debug!(error = %e, "change event delivery failed (indexer absent?)");
                }
            }
        });
    }
}
