// crates/server/src/error.rs
// The single error boundary for the tool surface. Tools never raise across
// the RPC boundary: every response is `{ok: bool, ...}`, and a ToolError
// renders as `{ok: false, error: {code, message, suggestion?}, ...}`.

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use scribe_core::{DocError, FileError, StateError};
use scribe_db::DbError;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("No project configured. Invoke set_project before using this tool.")]
    ProjectResolution { recent_projects: Vec<String> },

    #[error("Rate limit exceeded for project log writes")]
    RateLimitExceeded { retry_after_seconds: u64 },

    #[error("Invalid message: {0}")]
    MessageInvalid(String),

    #[error("Invalid metadata: {0}")]
    MetadataInvalid(String),

    #[error("Missing metadata for log entry: {}", missing.join(", "))]
    MetadataRequirementsMissing {
        log_type: String,
        missing: Vec<String>,
    },

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Doc(#[from] DocError),

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Invalid parameter {field}: {message}")]
    InvalidParameter { field: String, message: String },
}

impl ToolError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProjectResolution { .. } => "ProjectResolutionError",
            Self::RateLimitExceeded { .. } => "RateLimitExceeded",
            Self::MessageInvalid(_) => "MessageInvalid",
            Self::MetadataInvalid(_) => "MetadataInvalid",
            Self::MetadataRequirementsMissing { .. } => "MetadataRequirementsMissing",
            Self::File(FileError::PathEscape { .. }) => "PathEscape",
            Self::File(FileError::LockTimeout { .. }) => "LockTimeout",
            Self::File(FileError::AtomicWriteFailure { .. }) => "AtomicWriteFailure",
            Self::File(FileError::BackupFailure { .. }) => "BackupFailure",
            Self::File(_) => "FileWriteFailure",
            Self::State(StateError::VersionConflict { .. }) => "VersionConflict",
            Self::State(_) => "StateFailure",
            Self::Doc(DocError::PatchHashMismatch { .. }) => "PatchHashMismatch",
            Self::Doc(DocError::SectionNotFound { .. }) => "SectionNotFound",
            Self::Doc(DocError::DuplicateAnchor { .. }) => "DuplicateAnchor",
            Self::Doc(DocError::DocNotRegistered { .. }) => "DocNotRegistered",
            Self::Doc(_) => "DocEditFailure",
            Self::Storage(_) => "StorageFailure",
            Self::InvalidParameter { .. } => "InvalidParameter",
        }
    }

    /// Recovery hint shown alongside the error.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ProjectResolution { .. } => {
                Some("Invoke set_project before using this tool.".into())
            }
            Self::RateLimitExceeded {
                retry_after_seconds,
            } => Some(format!("Retry after {retry_after_seconds} seconds.")),
            Self::MetadataRequirementsMissing { log_type, missing } => Some(format!(
                "Add the required keys for '{log_type}' entries: {}.",
                missing.join(", ")
            )),
            Self::Doc(DocError::PatchHashMismatch { .. }) => {
                Some("Re-read the document and regenerate the patch against its current hash.".into())
            }
            Self::Doc(DocError::SectionNotFound { .. }) => Some(
                "List sections first; anchors look like <!-- ID: name -->.".into(),
            ),
            Self::State(StateError::VersionConflict { .. }) => {
                Some("Re-read the project context and retry with its current version.".into())
            }
            _ => None,
        }
    }

    /// Render as the `{ok:false}` payload.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(suggestion) = self.suggestion() {
            error["suggestion"] = json!(suggestion);
        }
        let mut payload = json!({ "ok": false, "error": error });
        match self {
            Self::ProjectResolution { recent_projects } => {
                payload["recent_projects"] = json!(recent_projects);
            }
            Self::RateLimitExceeded {
                retry_after_seconds,
            } => {
                payload["retry_after_seconds"] = json!(retry_after_seconds);
            }
            Self::MetadataRequirementsMissing { missing, .. } => {
                payload["missing"] = json!(missing);
            }
            _ => {}
        }
        payload
    }
}

impl IntoResponse for ToolError {
    fn into_response(self) -> Response {
        tracing::warn!(code = self.code(), error = %self, "tool call failed");
        // Always HTTP 200: the envelope's `ok` flag is the contract.
        Json(self.to_payload()).into_response()
    }
}

/// Result type alias for tool handlers.
pub type ToolResult<T> = Result<T, ToolError>;
