// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the file layer: sandboxing, locking, atomic writes,
/// journaling, rotation mechanics. Fatal to the operation that hit them.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("Path escapes the repository sandbox: {path} (root: {root})")]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("Timed out acquiring lock on {path} after {waited_ms} ms")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("Atomic write to {path} failed: {message}")]
    AtomicWriteFailure { path: PathBuf, message: String },

    #[error("Preflight backup of {path} failed: {source}")]
    BackupFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("Cannot rotate {path}: {reason}")]
    RotationRejected { path: PathBuf, reason: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileError {
    /// Classify an io::Error into the matching variant for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors from the state manager (JSON snapshot of process state).
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Version conflict: expected {expected}, current is {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Failed to persist state to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state snapshot at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

/// Errors from the document manager's editing mechanics.
#[derive(Debug, Error)]
pub enum DocError {
    #[error("Section anchor not found: {anchor}")]
    SectionNotFound { anchor: String },

    #[error("Duplicate section anchor '{anchor}' at lines {lines:?}")]
    DuplicateAnchor { anchor: String, lines: Vec<usize> },

    #[error("Patch precondition failed: file hash {actual} does not match expected {expected}")]
    PatchHashMismatch { expected: String, actual: String },

    #[error("Line range {start}..{end} is out of bounds (body has {body_lines} lines)")]
    RangeOutOfBounds {
        start: usize,
        end: usize,
        body_lines: usize,
    },

    #[error("Document '{doc}' is not registered for this project")]
    DocNotRegistered { doc: String },

    #[error("Malformed patch: {message}")]
    MalformedPatch { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_error_display_contains_path() {
        let err = FileError::PathEscape {
            path: PathBuf::from("/outside/secret"),
            root: PathBuf::from("/repo"),
        };
        assert!(err.to_string().contains("/outside/secret"));
        assert!(err.to_string().contains("/repo"));
    }

    #[test]
    fn file_error_io_classification() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            FileError::io("/x", io_err),
            FileError::NotFound { .. }
        ));

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            FileError::io("/x", io_err),
            FileError::PermissionDenied { .. }
        ));

        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(FileError::io("/x", io_err), FileError::Io { .. }));
    }

    #[test]
    fn state_error_version_conflict_display() {
        let err = StateError::VersionConflict {
            expected: 3,
            actual: 5,
        };
        assert!(err.to_string().contains("expected 3"));
        assert!(err.to_string().contains("current is 5"));
    }

    #[test]
    fn doc_error_duplicate_anchor_lists_lines() {
        let err = DocError::DuplicateAnchor {
            anchor: "overview".into(),
            lines: vec![4, 19],
        };
        let text = err.to_string();
        assert!(text.contains("overview"));
        assert!(text.contains("4"));
        assert!(text.contains("19"));
    }
}
