// crates/core/src/integrity.rs
// Streamed file integrity: SHA-256 and newline count share one 4 KiB-chunk
// pass so large logs are never loaded whole.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::FileError;

const CHUNK_SIZE: usize = 4 * 1024;

/// Result of a full integrity pass over a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIntegrity {
    pub size_bytes: u64,
    pub sha256: String,
    /// Newline count, with a trailing partial line counted as one.
    pub line_count: u64,
}

/// Hash and count lines in one streaming pass.
pub async fn hash_and_count(path: &Path) -> Result<FileIntegrity, FileError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_and_count_sync(&path))
        .await
        .map_err(|e| {
            FileError::io(
                std::path::PathBuf::new(),
                std::io::Error::new(std::io::ErrorKind::Other, e),
            )
        })?
}

fn hash_and_count_sync(path: &Path) -> Result<FileIntegrity, FileError> {
    let mut file = std::fs::File::open(path).map_err(|e| FileError::io(path.to_path_buf(), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    let mut size: u64 = 0;
    let mut newlines: u64 = 0;
    let mut last_byte: Option<u8> = None;

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| FileError::io(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        hasher.update(chunk);
        newlines += memchr::memchr_iter(b'\n', chunk).count() as u64;
        size += n as u64;
        last_byte = Some(chunk[n - 1]);
    }

    let line_count = match last_byte {
        None => 0,
        Some(b'\n') => newlines,
        // File ends mid-line; the partial line still counts.
        Some(_) => newlines + 1,
    };

    Ok(FileIntegrity {
        size_bytes: size,
        sha256: hex::encode(hasher.finalize()),
        line_count,
    })
}

/// SHA-256 of an in-memory byte string, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn empty_file_has_zero_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.md");
        std::fs::write(&path, "").unwrap();

        let info = hash_and_count(&path).await.unwrap();
        assert_eq!(info.size_bytes, 0);
        assert_eq!(info.line_count, 0);
        // SHA-256 of the empty string.
        assert_eq!(
            info.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn trailing_partial_line_counts_as_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.md");
        std::fs::write(&path, "one\ntwo\nthree").unwrap();

        let info = hash_and_count(&path).await.unwrap();
        assert_eq!(info.line_count, 3);
    }

    #[tokio::test]
    async fn trailing_newline_does_not_add_a_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.md");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

        let info = hash_and_count(&path).await.unwrap();
        assert_eq!(info.line_count, 3);
    }

    #[tokio::test]
    async fn hash_matches_known_digest_across_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.md");
        // Larger than one 4 KiB chunk to exercise the streaming path.
        let content = "x".repeat(10_000);
        std::fs::write(&path, &content).unwrap();

        let info = hash_and_count(&path).await.unwrap();
        assert_eq!(info.size_bytes, 10_000);
        assert_eq!(info.sha256, sha256_hex(content.as_bytes()));
        assert_eq!(info.line_count, 1);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let err = hash_and_count(&dir.path().join("nope.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::NotFound { .. }));
    }
}
