// crates/core/src/estimator.rs
// Entry-count estimation for rotation decisions.
//
// Three tiers, cheapest first: an exact cache hit on (size, mtime), an EMA
// bytes-per-line estimate, and a tail-sample refinement over the trailing
// megabyte. Precise counts (full pass) live in `integrity.rs`; callers
// escalate to them only when the classification stays undecided.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FileError;

/// Bytes-per-line EMA clamp bounds.
pub const EMA_MIN: f64 = 16.0;
pub const EMA_MAX: f64 = 512.0;

/// Starting point when no EMA has been observed for a file yet.
pub const DEFAULT_BYTES_PER_LINE: f64 = 80.0;

/// EMA blend factor after a precise count.
pub const ALPHA_PRECISE: f64 = 0.2;
/// EMA blend factor after an estimate-derived observation.
pub const ALPHA_ESTIMATE: f64 = 0.1;

const ESTIMATION_BAND_RATIO: f64 = 0.1;
const ESTIMATION_BAND_MIN: u64 = 250;

/// Approximate values must clear this fraction above the threshold before
/// they classify as `Above`; precise counts use the plain `>=` rule.
const HYSTERESIS_RATIO: f64 = 0.05;

/// Maximum tail sample read for refinement.
const TAIL_SAMPLE_MAX: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    Cache,
    Ema,
    TailSample,
    Precise,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryCountEstimate {
    pub count: u64,
    pub approximate: bool,
    pub method: EstimationMethod,
    pub bytes_per_line: f64,
}

/// Classification of an entry-count value against a rotation threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdClass {
    Below,
    Above,
    Undecided,
}

/// Filesystem identity of a log file at estimation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatSnapshot {
    pub size_bytes: u64,
    pub mtime_ns: i128,
    pub inode: u64,
}

/// Cached per-file stats carried by the state manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedStats {
    pub size_bytes: u64,
    pub mtime_ns: i128,
    pub line_count: u64,
    pub ema_bytes_per_line: Option<f64>,
}

/// Stat a file into the snapshot the estimator consumes.
pub fn stat_snapshot(path: &Path) -> Result<FileStatSnapshot, FileError> {
    let meta = std::fs::metadata(path).map_err(|e| FileError::io(path.to_path_buf(), e))?;
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0);
    #[cfg(unix)]
    let inode = {
        use std::os::unix::fs::MetadataExt;
        meta.ino()
    };
    #[cfg(not(unix))]
    let inode = 0;
    Ok(FileStatSnapshot {
        size_bytes: meta.len(),
        mtime_ns,
        inode,
    })
}

pub fn clamp_bytes_per_line(value: f64) -> f64 {
    value.clamp(EMA_MIN, EMA_MAX)
}

/// Blend a new bytes-per-line observation into the EMA.
pub fn blend_ema(current: Option<f64>, observed: f64, alpha: f64) -> f64 {
    let observed = clamp_bytes_per_line(observed);
    match current {
        Some(ema) => clamp_bytes_per_line((1.0 - alpha) * ema + alpha * observed),
        None => observed,
    }
}

/// Estimate the entry count of a file from its stat and cached history.
///
/// Cache hit requires an exact `(size, mtime)` match and returns the cached
/// precise count. Otherwise the EMA (cached or default) divides the size.
pub fn estimate_entry_count(
    stat: &FileStatSnapshot,
    cached: Option<&CachedStats>,
) -> EntryCountEstimate {
    if stat.size_bytes == 0 {
        return EntryCountEstimate {
            count: 0,
            approximate: false,
            method: EstimationMethod::Cache,
            bytes_per_line: DEFAULT_BYTES_PER_LINE,
        };
    }

    if let Some(cache) = cached {
        if cache.size_bytes == stat.size_bytes && cache.mtime_ns == stat.mtime_ns {
            return EntryCountEstimate {
                count: cache.line_count,
                approximate: false,
                method: EstimationMethod::Cache,
                bytes_per_line: cache
                    .ema_bytes_per_line
                    .map(clamp_bytes_per_line)
                    .unwrap_or(DEFAULT_BYTES_PER_LINE),
            };
        }
    }

    let ema = cached
        .and_then(|c| c.ema_bytes_per_line)
        .map(clamp_bytes_per_line)
        .unwrap_or(DEFAULT_BYTES_PER_LINE);
    let count = ((stat.size_bytes as f64 / ema).round() as u64).max(1);
    EntryCountEstimate {
        count,
        approximate: true,
        method: EstimationMethod::Ema,
        bytes_per_line: ema,
    }
}

/// Refine an approximate estimate by sampling the trailing `min(size, 1 MiB)`.
pub async fn refine_with_tail_sample(
    path: &Path,
    stat: &FileStatSnapshot,
) -> Result<EntryCountEstimate, FileError> {
    let path_buf = path.to_path_buf();
    let size = stat.size_bytes;
    let sample_len = size.min(TAIL_SAMPLE_MAX);

    let newlines = tokio::task::spawn_blocking(move || -> Result<u64, FileError> {
        let mut file =
            std::fs::File::open(&path_buf).map_err(|e| FileError::io(path_buf.clone(), e))?;
        file.seek(SeekFrom::End(-(sample_len as i64)))
            .map_err(|e| FileError::io(path_buf.clone(), e))?;
        let mut buf = vec![0u8; sample_len as usize];
        file.read_exact(&mut buf)
            .map_err(|e| FileError::io(path_buf.clone(), e))?;
        Ok(memchr::memchr_iter(b'\n', &buf).count() as u64)
    })
    .await
    .map_err(|e| {
        FileError::io(
            path.to_path_buf(),
            std::io::Error::new(std::io::ErrorKind::Other, e),
        )
    })??;

    let bytes_per_line = if newlines == 0 {
        EMA_MAX
    } else {
        clamp_bytes_per_line(sample_len as f64 / newlines as f64)
    };
    let count = ((size as f64 / bytes_per_line).round() as u64).max(1);
    Ok(EntryCountEstimate {
        count,
        approximate: true,
        method: EstimationMethod::TailSample,
        bytes_per_line,
    })
}

/// Ambiguity band around a rotation threshold.
pub fn estimation_band(threshold: u64) -> u64 {
    ((threshold as f64 * ESTIMATION_BAND_RATIO) as u64).max(ESTIMATION_BAND_MIN)
}

/// Classify a value against the threshold.
///
/// Precise values use the plain rule (`>= threshold` is above). Approximate
/// values carry hysteresis: they must clear the threshold by 5% before they
/// count as above, and land `Undecided` in between so the caller escalates
/// to a sharper method.
pub fn classify(value: u64, threshold: u64, approximate: bool) -> ThresholdClass {
    let band = estimation_band(threshold);
    if value <= threshold.saturating_sub(band) {
        return ThresholdClass::Below;
    }
    let above = if approximate {
        let margin = (threshold as f64 * HYSTERESIS_RATIO).ceil() as u64;
        value > threshold + margin
    } else {
        value >= threshold
    };
    if above {
        ThresholdClass::Above
    } else {
        ThresholdClass::Undecided
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn stat(size: u64) -> FileStatSnapshot {
        FileStatSnapshot {
            size_bytes: size,
            mtime_ns: 1_700_000_000_000_000_000,
            inode: 42,
        }
    }

    #[test]
    fn cache_hit_returns_precise_count() {
        let cached = CachedStats {
            size_bytes: 5000,
            mtime_ns: 1_700_000_000_000_000_000,
            line_count: 61,
            ema_bytes_per_line: Some(82.0),
        };
        let est = estimate_entry_count(&stat(5000), Some(&cached));
        assert_eq!(est.count, 61);
        assert!(!est.approximate);
        assert_eq!(est.method, EstimationMethod::Cache);
    }

    #[test]
    fn stale_cache_falls_back_to_ema() {
        let cached = CachedStats {
            size_bytes: 4000,
            mtime_ns: 1,
            line_count: 50,
            ema_bytes_per_line: Some(80.0),
        };
        let est = estimate_entry_count(&stat(5000), Some(&cached));
        assert_eq!(est.count, 63); // round(5000 / 80) = 63
        assert!(est.approximate);
        assert_eq!(est.method, EstimationMethod::Ema);
    }

    #[test]
    fn no_cache_uses_default_bytes_per_line() {
        let est = estimate_entry_count(&stat(8000), None);
        assert_eq!(est.count, 100);
        assert_eq!(est.bytes_per_line, DEFAULT_BYTES_PER_LINE);
    }

    #[test]
    fn empty_file_estimates_zero() {
        let est = estimate_entry_count(&stat(0), None);
        assert_eq!(est.count, 0);
        assert!(!est.approximate);
    }

    #[test]
    fn ema_clamps_to_bounds() {
        assert_eq!(clamp_bytes_per_line(1.0), EMA_MIN);
        assert_eq!(clamp_bytes_per_line(10_000.0), EMA_MAX);
        assert_eq!(clamp_bytes_per_line(100.0), 100.0);
    }

    #[test]
    fn ema_blend_moves_toward_observation() {
        let blended = blend_ema(Some(80.0), 120.0, ALPHA_PRECISE);
        assert!((blended - 88.0).abs() < 1e-9);
        // No prior EMA adopts the observation outright.
        assert_eq!(blend_ema(None, 96.0, ALPHA_PRECISE), 96.0);
    }

    #[test]
    fn band_has_a_floor_of_250() {
        assert_eq!(estimation_band(50), 250);
        assert_eq!(estimation_band(500), 250);
        assert_eq!(estimation_band(10_000), 1000);
    }

    // Boundary triple around one estimate: size 5000, EMA 80 -> 63 entries.
    #[test]
    fn classification_boundary_examples() {
        let cached = CachedStats {
            size_bytes: 1,
            mtime_ns: 0,
            line_count: 0,
            ema_bytes_per_line: Some(80.0),
        };
        let est = estimate_entry_count(&stat(5000), Some(&cached));
        assert_eq!(est.count, 63);

        assert_eq!(classify(est.count, 50, true), ThresholdClass::Above);
        assert_eq!(classify(est.count, 500, true), ThresholdClass::Below);
        assert_eq!(classify(est.count, 60, true), ThresholdClass::Undecided);
    }

    #[test]
    fn precise_values_use_plain_threshold_rule() {
        assert_eq!(classify(63, 60, false), ThresholdClass::Above);
        assert_eq!(classify(60, 60, false), ThresholdClass::Above);
        assert_eq!(classify(59, 60, false), ThresholdClass::Undecided);
        assert_eq!(classify(1, 500, false), ThresholdClass::Below);
    }

    #[tokio::test]
    async fn tail_sample_refines_from_real_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LOG.md");
        // 100 lines of exactly 50 bytes (49 chars + newline).
        let line = format!("{}\n", "x".repeat(49));
        std::fs::write(&path, line.repeat(100)).unwrap();

        let stat = stat_snapshot(&path).unwrap();
        let est = refine_with_tail_sample(&path, &stat).await.unwrap();
        assert_eq!(est.method, EstimationMethod::TailSample);
        assert_eq!(est.count, 100);
        assert!((est.bytes_per_line - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn tail_sample_without_newlines_uses_max_bytes_per_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LOG.md");
        std::fs::write(&path, "x".repeat(2048)).unwrap();

        let stat = stat_snapshot(&path).unwrap();
        let est = refine_with_tail_sample(&path, &stat).await.unwrap();
        assert_eq!(est.bytes_per_line, EMA_MAX);
        assert_eq!(est.count, 4); // 2048 / 512
    }
}
