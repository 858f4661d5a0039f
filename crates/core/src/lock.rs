// crates/core/src/lock.rs
// Cross-process advisory locking on a sibling `<file>.lock`.
//
// The lock file is deliberately distinct from the target: the target gets
// renamed during rotation, and locking a sibling keeps the mechanism valid
// across that rename (and portable to platforms without mandatory locks).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::FileError;

/// Default lock acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for a contended lock.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An exclusive advisory lock held on `<target>.lock`.
///
/// Released on drop. Acquisition is a poll loop so a timeout can be
/// enforced without platform-specific blocking-with-deadline support.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
    file: File,
}

impl FileLock {
    /// Path of the sibling lock file for `target`.
    pub fn lock_path_for(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        target.with_file_name(name)
    }

    /// Acquire the lock for `target` with the default 30 s timeout.
    pub async fn acquire(target: &Path) -> Result<Self, FileError> {
        Self::acquire_timeout(target, DEFAULT_LOCK_TIMEOUT).await
    }

    /// Acquire the lock for `target`, polling every 100 ms up to `timeout`.
    pub async fn acquire_timeout(target: &Path, timeout: Duration) -> Result<Self, FileError> {
        let lock_path = Self::lock_path_for(target);
        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FileError::io(parent.to_path_buf(), e))?;
        }

        let start = Instant::now();
        loop {
            let lock_path_clone = lock_path.clone();
            // fs2 lock ops are blocking; keep them off the async executor.
            let attempt = tokio::task::spawn_blocking(move || -> std::io::Result<Option<File>> {
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .read(true)
                    .write(true)
                    .open(&lock_path_clone)?;
                match file.try_lock_exclusive() {
                    Ok(()) => Ok(Some(file)),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(|e| {
                FileError::io(
                    lock_path.clone(),
                    std::io::Error::new(std::io::ErrorKind::Other, e),
                )
            })?;

            match attempt {
                Ok(Some(file)) => {
                    return Ok(Self {
                        lock_path,
                        file,
                    })
                }
                Ok(None) => {
                    if start.elapsed() >= timeout {
                        return Err(FileError::LockTimeout {
                            path: lock_path,
                            waited_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(FileError::io(lock_path, e)),
            }
        }
    }

    /// Path of the held lock file.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Unlock errors on drop are unreportable; the OS releases the lock
        // when the descriptor closes anyway.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
