// crates/core/src/journal.rs
// Write-ahead journal for crash-safe log appends.
//
// Every logical append writes an `append` record to `<file>.journal`,
// fsyncs it, applies the append to the target under the sibling file lock,
// then writes a `commit` record. Startup replay appends any record without
// a matching commit; replay is idempotent because the deterministic entry
// id is embedded in the content line.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::atomic::{fsync_dir, sibling_with_suffix};
use crate::error::FileError;
use crate::lock::FileLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Append {
        id: String,
        timestamp: String,
        content: String,
        file_path: String,
    },
    Commit {
        ref_id: String,
    },
    Rotate {
        from: String,
        to: String,
        rotation_id: String,
        timestamp: String,
        sequence: u64,
        entries_rotated: u64,
        log_type: String,
    },
}

/// Journal path for a target log file: `<file>.journal`.
pub fn journal_path_for(target: &Path) -> PathBuf {
    sibling_with_suffix(target, ".journal")
}

/// Durably append `line` to `target` through the write-ahead journal.
///
/// The sibling file lock is held across journal-write, append, and commit,
/// so concurrent appenders (and rotations) serialize per file. Returns the
/// journal record id.
pub async fn append_line(target: &Path, line: &str) -> Result<String, FileError> {
    let _lock = FileLock::acquire(target).await?;
    let target = target.to_path_buf();
    let line = line.to_string();
    tokio::task::spawn_blocking(move || append_line_journaled(&target, &line))
        .await
        .map_err(|e| FileError::AtomicWriteFailure {
            path: PathBuf::new(),
            message: format!("append task panicked: {e}"),
        })?
}

fn append_line_journaled(target: &Path, line: &str) -> Result<String, FileError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| FileError::io(parent.to_path_buf(), e))?;
    }

    let journal = journal_path_for(target);
    let record_id = journal_record_id(line);

    write_record(
        &journal,
        &JournalRecord::Append {
            id: record_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            content: line.to_string(),
            file_path: target.display().to_string(),
        },
        true,
    )?;

    apply_append(target, line)?;

    // A commit that fails to hit the disk only costs a redundant (and
    // idempotent) replay on the next startup.
    if let Err(e) = write_record(
        &journal,
        &JournalRecord::Commit {
            ref_id: record_id.clone(),
        },
        false,
    ) {
        warn!(journal = %journal.display(), error = %e, "journal commit write failed");
    } else {
        compact_if_fully_committed(&journal);
    }

    Ok(record_id)
}

fn apply_append(target: &Path, line: &str) -> Result<(), FileError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .map_err(|e| FileError::io(target.to_path_buf(), e))?;
    file.write_all(line.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|e| FileError::io(target.to_path_buf(), e))?;
    if let Some(parent) = target.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Record a rotation in the journal (best-effort audit trail).
pub async fn record_rotation(
    target: &Path,
    archive: &Path,
    rotation_id: &str,
    sequence: u64,
    entries_rotated: u64,
    log_type: &str,
) {
    let record = JournalRecord::Rotate {
        from: target.display().to_string(),
        to: archive.display().to_string(),
        rotation_id: rotation_id.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        sequence,
        entries_rotated,
        log_type: log_type.to_string(),
    };
    let journal = journal_path_for(target);
    if let Err(e) = write_record(&journal, &record, false) {
        warn!(journal = %journal.display(), error = %e, "rotation journal write failed");
    }
}

/// Replay uncommitted appends from `<target>.journal` after a crash.
///
/// Each `append` record without a matching `commit` is re-applied unless
/// its exact content line is already present in the target, then committed.
/// Returns the number of records re-applied. Malformed journal lines are
/// skipped with a warning rather than failing recovery.
pub async fn replay_uncommitted(target: &Path) -> Result<usize, FileError> {
    let journal = journal_path_for(target);
    if !journal.exists() {
        return Ok(0);
    }

    let _lock = FileLock::acquire(target).await?;
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || replay_sync(&target))
        .await
        .map_err(|e| FileError::AtomicWriteFailure {
            path: PathBuf::new(),
            message: format!("replay task panicked: {e}"),
        })?
}

fn replay_sync(target: &Path) -> Result<usize, FileError> {
    let journal = journal_path_for(target);
    let raw = std::fs::read_to_string(&journal).map_err(|e| FileError::io(journal.clone(), e))?;

    let mut pending: Vec<(String, String)> = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(JournalRecord::Append { id, content, .. }) => pending.push((id, content)),
            Ok(JournalRecord::Commit { ref_id }) => pending.retain(|(id, _)| *id != ref_id),
            Ok(JournalRecord::Rotate { .. }) => {}
            Err(e) => {
                warn!(journal = %journal.display(), error = %e, "skipping malformed journal record");
            }
        }
    }

    if pending.is_empty() {
        let _ = std::fs::remove_file(&journal);
        return Ok(0);
    }

    let existing = std::fs::read_to_string(target).unwrap_or_default();
    let mut replayed = 0usize;
    for (id, content) in pending {
        if !existing.lines().any(|l| l == content) {
            apply_append(target, &content)?;
            replayed += 1;
        }
        write_record(&journal, &JournalRecord::Commit { ref_id: id }, false)?;
    }

    // Everything is committed now; start the journal fresh.
    let _ = std::fs::remove_file(&journal);
    Ok(replayed)
}

fn write_record(journal: &Path, record: &JournalRecord, sync: bool) -> Result<(), FileError> {
    let encoded = serde_json::to_string(record).map_err(|e| FileError::AtomicWriteFailure {
        path: journal.to_path_buf(),
        message: format!("journal encode failed: {e}"),
    })?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal)
        .map_err(|e| FileError::io(journal.to_path_buf(), e))?;
    file.write_all(encoded.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|e| FileError::io(journal.to_path_buf(), e))?;
    if sync {
        file.sync_all()
            .map_err(|e| FileError::io(journal.to_path_buf(), e))?;
    }
    Ok(())
}

/// Truncate the journal once every append record has a commit. Holding the
/// target's file lock makes this safe against concurrent writers.
fn compact_if_fully_committed(journal: &Path) {
    let Ok(raw) = std::fs::read_to_string(journal) else {
        return;
    };
    let mut open_ids: Vec<String> = Vec::new();
    for line in raw.lines() {
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(JournalRecord::Append { id, .. }) => open_ids.push(id),
            Ok(JournalRecord::Commit { ref_id }) => open_ids.retain(|id| *id != ref_id),
            _ => {}
        }
    }
    if open_ids.is_empty() {
        let _ = std::fs::remove_file(journal);
    }
}

fn journal_record_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!(
        "{}_{}",
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f%:z"),
        &hex::encode(digest)[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn append_writes_line_and_clears_journal() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("LOG.md");

        append_line(&target, "[ℹ️] first entry").await.unwrap();
        append_line(&target, "[ℹ️] second entry").await.unwrap();

        let content = std::fs::read_to_string(&target).unwrap();
        assert_eq!(content, "[ℹ️] first entry\n[ℹ️] second entry\n");
        // Fully committed journals are compacted away.
        assert!(!journal_path_for(&target).exists());
    }

    #[tokio::test]
    async fn replay_applies_uncommitted_record() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("LOG.md");
        std::fs::write(&target, "existing line\n").unwrap();

        // Simulate a crash: append record journaled, never applied or committed.
        let record = JournalRecord::Append {
            id: "rec-1".into(),
            timestamp: Utc::now().to_rfc3339(),
            content: "[✅] recovered entry [ID: abc123]".into(),
            file_path: target.display().to_string(),
        };
        write_record(&journal_path_for(&target), &record, true).unwrap();

        let replayed = replay_uncommitted(&target).await.unwrap();
        assert_eq!(replayed, 1);

        let content = std::fs::read_to_string(&target).unwrap();
        assert_eq!(content, "existing line\n[✅] recovered entry [ID: abc123]\n");
        assert!(!journal_path_for(&target).exists());
    }

    #[tokio::test]
    async fn replay_is_idempotent_for_applied_but_uncommitted() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("LOG.md");
        // Crash happened after the append hit the file but before commit.
        std::fs::write(&target, "[✅] entry [ID: abc123]\n").unwrap();

        let record = JournalRecord::Append {
            id: "rec-1".into(),
            timestamp: Utc::now().to_rfc3339(),
            content: "[✅] entry [ID: abc123]".into(),
            file_path: target.display().to_string(),
        };
        write_record(&journal_path_for(&target), &record, true).unwrap();

        let replayed = replay_uncommitted(&target).await.unwrap();
        assert_eq!(replayed, 0, "already-applied record must not double-append");

        let content = std::fs::read_to_string(&target).unwrap();
        assert_eq!(content, "[✅] entry [ID: abc123]\n");
    }

    #[tokio::test]
    async fn replay_with_no_journal_is_a_noop() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("LOG.md");
        assert_eq!(replay_uncommitted(&target).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replay_skips_malformed_journal_lines() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("LOG.md");
        std::fs::write(journal_path_for(&target), "not json at all\n").unwrap();

        assert_eq!(replay_uncommitted(&target).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn committed_records_are_not_replayed() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("LOG.md");
        std::fs::write(&target, "line one\n").unwrap();

        let journal = journal_path_for(&target);
        write_record(
            &journal,
            &JournalRecord::Append {
                id: "rec-1".into(),
                timestamp: Utc::now().to_rfc3339(),
                content: "line one".into(),
                file_path: target.display().to_string(),
            },
            true,
        )
        .unwrap();
        write_record(
            &journal,
            &JournalRecord::Commit {
                ref_id: "rec-1".into(),
            },
            false,
        )
        .unwrap();

        assert_eq!(replay_uncommitted(&target).await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "line one\n");
    }
}
