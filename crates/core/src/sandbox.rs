// crates/core/src/sandbox.rs
// Repository path sandbox. Every file the ledger touches must resolve
// under the repo root; symlink and parent-traversal escapes are rejected
// before any side effect happens.

use std::path::{Component, Path, PathBuf};

use crate::error::FileError;

/// Resolve `path` against `root` and verify the result stays inside `root`.
///
/// Relative paths are joined onto `root`. `..` components are normalized
/// lexically first so a traversal attempt is caught even when the target
/// does not exist yet. For existing paths, symlinks are resolved via
/// `canonicalize` and the real location is checked too.
pub fn resolve_in_sandbox(root: &Path, path: &Path) -> Result<PathBuf, FileError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    let normalized = normalize_lexically(&joined);
    if !normalized.starts_with(root) {
        return Err(FileError::PathEscape {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        });
    }

    // Symlink check: canonicalize the deepest existing ancestor. A symlink
    // inside the tree pointing outside must not pass.
    let mut probe = normalized.clone();
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent.to_path_buf(),
            None => break,
        }
    }
    if probe.exists() {
        let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let canonical = probe
            .canonicalize()
            .map_err(|e| FileError::io(probe.clone(), e))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(FileError::PathEscape {
                path: path.to_path_buf(),
                root: root.to_path_buf(),
            });
        }
    }

    Ok(normalized)
}

/// Normalize `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn relative_path_resolves_under_root() {
        let dir = tempdir().unwrap();
        let resolved = resolve_in_sandbox(dir.path(), Path::new("docs/LOG.md")).unwrap();
        assert!(resolved.starts_with(dir.path()));
        assert!(resolved.ends_with("docs/LOG.md"));
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let dir = tempdir().unwrap();
        let err = resolve_in_sandbox(dir.path(), Path::new("../outside.md")).unwrap_err();
        assert!(matches!(err, FileError::PathEscape { .. }));
    }

    #[test]
    fn deep_traversal_through_subdir_is_rejected() {
        let dir = tempdir().unwrap();
        let err =
            resolve_in_sandbox(dir.path(), Path::new("docs/../../../etc/passwd")).unwrap_err();
        assert!(matches!(err, FileError::PathEscape { .. }));
    }

    #[test]
    fn absolute_path_inside_root_is_accepted() {
        let dir = tempdir().unwrap();
        let inside = dir.path().join("notes.md");
        let resolved = resolve_in_sandbox(dir.path(), &inside).unwrap();
        assert_eq!(resolved, inside);
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let dir = tempdir().unwrap();
        let err = resolve_in_sandbox(dir.path(), Path::new("/etc/passwd")).unwrap_err();
        assert!(matches!(err, FileError::PathEscape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let link = root.path().join("link");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let err = resolve_in_sandbox(root.path(), Path::new("link/file.md")).unwrap_err();
        assert!(matches!(err, FileError::PathEscape { .. }));
    }

    #[test]
    fn nonexistent_target_still_resolves() {
        let dir = tempdir().unwrap();
        let resolved =
            resolve_in_sandbox(dir.path(), Path::new("docs/dev_plans/new/PROGRESS_LOG.md"))
                .unwrap();
        assert!(resolved.starts_with(dir.path()));
    }
}
