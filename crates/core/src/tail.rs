// crates/core/src/tail.rs
// Backward file reading: bounded tail reads for recovery and display, and
// a restartable reverse line iterator for the query engine's file-scan
// fallback. Neither loads the whole file.

use std::io;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Chunk size for backward reading: 8KB.
const CHUNK_SIZE: u64 = 8 * 1024;

/// Read the last `n` lines of a file in chronological order.
///
/// Seeks to EOF and reads backwards in 8KB chunks until enough newlines
/// are seen. A trailing newline at EOF does not produce an empty last
/// line; lines longer than the chunk size are assembled correctly.
pub async fn tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = tokio::fs::File::open(path).await?;
    let file_len = file.metadata().await?.len();
    if file_len == 0 {
        return Ok(Vec::new());
    }

    let mut collected: Vec<u8> = Vec::new();
    let mut remaining = file_len;
    // n+1 newlines fully delimit n lines from the end (the extra one is the
    // boundary before the first included line).
    let target_newlines = n + 1;
    let mut newline_count = 0usize;

    while remaining > 0 {
        let chunk_len = remaining.min(CHUNK_SIZE);
        let offset = remaining - chunk_len;

        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; chunk_len as usize];
        file.read_exact(&mut buf).await?;

        newline_count += memchr::memchr_iter(b'\n', &buf).count();

        buf.append(&mut collected);
        collected = buf;
        remaining = offset;

        if newline_count >= target_newlines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&collected);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let all_lines: Vec<&str> = text.split('\n').collect();
    let start = all_lines.len().saturating_sub(n);
    Ok(all_lines[start..].iter().map(|s| s.to_string()).collect())
}

/// Lazy reverse-order line iterator.
///
/// Yields lines newest-first, reading the file backwards one chunk at a
/// time. The iterator is finite and holds at most one chunk plus one
/// partial line in memory, so the query fallback can stop at its page
/// size without paying for the rest of the file.
pub struct ReverseLineReader {
    file: std::fs::File,
    path: PathBuf,
    /// Unread region is [0, remaining).
    remaining: u64,
    /// Lines from the current chunk, ready to pop (oldest at index 0).
    pending: Vec<String>,
    /// Bytes before the first newline of the last-read chunk; they belong
    /// to a line continued in the previous chunk.
    carry: Vec<u8>,
    done: bool,
}

impl ReverseLineReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            remaining: len,
            pending: Vec::new(),
            carry: Vec::new(),
            done: len == 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refill(&mut self) -> io::Result<()> {
        while self.pending.is_empty() && self.remaining > 0 {
            let chunk_len = self.remaining.min(CHUNK_SIZE);
            let offset = self.remaining - chunk_len;

            self.file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; chunk_len as usize];
            self.file.read_exact(&mut buf)?;
            self.remaining = offset;

            // Append the carried prefix of the line that straddles the
            // chunk boundary.
            buf.extend_from_slice(&self.carry);
            self.carry.clear();

            match memchr::memchr(b'\n', &buf) {
                None if self.remaining > 0 => {
                    // No newline in this chunk; every byte continues a line
                    // from an earlier chunk.
                    self.carry = buf;
                }
                Some(first_nl) if self.remaining > 0 => {
                    // Everything before the first newline continues a line
                    // from an earlier chunk; carry it.
                    let rest = buf.split_off(first_nl + 1);
                    buf.pop(); // drop the newline
                    self.carry = buf;
                    self.push_lines(&rest);
                }
                _ => {
                    // First chunk of the file.
                    self.push_lines(&buf);
                }
            }
        }

        if self.pending.is_empty() && self.remaining == 0 {
            if !self.carry.is_empty() {
                let line = String::from_utf8_lossy(&self.carry).to_string();
                self.carry.clear();
                self.pending.push(line);
            } else {
                self.done = true;
            }
        }
        Ok(())
    }

    fn push_lines(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let text = text.strip_suffix('\n').unwrap_or(&text);
        if text.is_empty() && bytes.len() <= 1 {
            return;
        }
        self.pending = text.split('\n').map(|s| s.to_string()).collect();
    }
}

impl Iterator for ReverseLineReader {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done && self.pending.is_empty() {
            return None;
        }
        if self.pending.is_empty() {
            if let Err(e) = self.refill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        match self.pending.pop() {
            Some(line) => Some(Ok(line)),
            None => {
                self.done = true;
                None
            }
        }
    }
}
