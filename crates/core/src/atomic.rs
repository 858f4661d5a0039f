// crates/core/src/atomic.rs
// Atomic overwrite and preflight backups.
//
// Overwrite discipline: write `<file>.tmp` in the same directory, fsync it,
// rename over the target (up to 5 attempts with a short backoff), then
// fsync the parent directory. Appends never go through this path; they use
// the journal in `journal.rs`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use crate::error::FileError;

const RENAME_ATTEMPTS: u32 = 5;
const RENAME_BACKOFF: Duration = Duration::from_millis(50);

/// Atomically replace the contents of `path` with `content`.
pub async fn atomic_write(path: &Path, content: &str) -> Result<(), FileError> {
    let path = path.to_path_buf();
    let content = content.to_string();
    tokio::task::spawn_blocking(move || atomic_write_sync(&path, &content))
        .await
        .map_err(|e| FileError::AtomicWriteFailure {
            path: PathBuf::new(),
            message: format!("write task panicked: {e}"),
        })?
}

fn atomic_write_sync(path: &Path, content: &str) -> Result<(), FileError> {
    let parent = path.parent().ok_or_else(|| FileError::AtomicWriteFailure {
        path: path.to_path_buf(),
        message: "target has no parent directory".into(),
    })?;
    std::fs::create_dir_all(parent).map_err(|e| FileError::io(parent.to_path_buf(), e))?;

    let tmp_path = sibling_with_suffix(path, ".tmp");
    {
        let mut tmp = std::fs::File::create(&tmp_path)
            .map_err(|e| FileError::io(tmp_path.clone(), e))?;
        tmp.write_all(content.as_bytes())
            .and_then(|_| tmp.sync_all())
            .map_err(|e| {
                let _ = std::fs::remove_file(&tmp_path);
                FileError::AtomicWriteFailure {
                    path: path.to_path_buf(),
                    message: format!("temp write failed: {e}"),
                }
            })?;
    }

    let mut last_err = None;
    for attempt in 0..RENAME_ATTEMPTS {
        match std::fs::rename(&tmp_path, path) {
            Ok(()) => {
                fsync_dir(parent)?;
                return Ok(());
            }
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < RENAME_ATTEMPTS {
                    std::thread::sleep(RENAME_BACKOFF);
                }
            }
        }
    }

    let _ = std::fs::remove_file(&tmp_path);
    Err(FileError::AtomicWriteFailure {
        path: path.to_path_buf(),
        message: format!(
            "rename failed after {RENAME_ATTEMPTS} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ),
    })
}

/// Copy `path` to a timestamped `.preflight-…​.bak` sibling before a
/// destructive rewrite. Returns the backup path.
pub async fn preflight_backup(path: &Path) -> Result<PathBuf, FileError> {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
    let backup = sibling_with_suffix(path, &format!(".preflight-{stamp}.bak"));
    tokio::fs::copy(path, &backup)
        .await
        .map_err(|e| FileError::BackupFailure {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(backup)
}

/// fsync a directory so a completed rename survives power loss.
pub fn fsync_dir(dir: &Path) -> Result<(), FileError> {
    #[cfg(unix)]
    {
        let handle = std::fs::File::open(dir).map_err(|e| FileError::io(dir.to_path_buf(), e))?;
        handle
            .sync_all()
            .map_err(|e| FileError::io(dir.to_path_buf(), e))?;
    }
    // On non-unix platforms directory fsync is not available; the rename
    // itself is still atomic.
    let _ = dir;
    Ok(())
}

/// `<name><suffix>` next to `path` (keeps the full original file name).
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_creates_and_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.md");

        atomic_write(&path, "first\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\n");

        atomic_write(&path, "second\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.md");
        atomic_write(&path, "content\n").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["doc.md".to_string()]);
    }

    #[tokio::test]
    async fn atomic_write_creates_missing_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("docs/dev_plans/demo/PROGRESS_LOG.md");
        atomic_write(&path, "# Progress Log\n").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn preflight_backup_copies_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LOG.md");
        std::fs::write(&path, "precious\n").unwrap();

        let backup = preflight_backup(&path).await.unwrap();
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("LOG.md.preflight-"));
        assert!(backup.to_string_lossy().ends_with(".bak"));
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "precious\n");
        // Original untouched.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "precious\n");
    }

    #[tokio::test]
    async fn preflight_backup_of_missing_file_fails() {
        let dir = tempdir().unwrap();
        let err = preflight_backup(&dir.path().join("nope.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::BackupFailure { .. }));
    }

    #[test]
    fn sibling_suffix_keeps_full_name() {
        let p = Path::new("/a/b/LOG.md");
        assert_eq!(
            sibling_with_suffix(p, ".tmp"),
            PathBuf::from("/a/b/LOG.md.tmp")
        );
        assert_eq!(
            sibling_with_suffix(p, ".journal"),
            PathBuf::from("/a/b/LOG.md.journal")
        );
    }
}
