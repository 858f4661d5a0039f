// crates/server/src/rate_limit.rs
// Per-project rolling-window rate limiting for log appends. One bucket
// per project name, each guarded by its own mutex created on demand;
// process-wide state with init at server start and teardown on drop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{ToolError, ToolResult};

#[derive(Debug)]
struct Bucket {
    timestamps: VecDeque<Instant>,
}

/// Rolling-window limiter: at most `count` appends per `window`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    count: u32,
    window: Duration,
    buckets: Arc<Mutex<HashMap<String, Arc<Mutex<Bucket>>>>>,
}

impl RateLimiter {
    pub fn new(count: u32, window_seconds: u64) -> Self {
        Self {
            count,
            window: Duration::from_secs(window_seconds),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admit one append for `project`, or fail with `RateLimitExceeded`
    /// carrying `retry_after_seconds = window − age(oldest entry)`.
    pub async fn check(&self, project: &str) -> ToolResult<()> {
        if self.count == 0 || self.window.is_zero() {
            return Ok(());
        }

        let bucket = {
            let mut map = self.buckets.lock().await;
            map.entry(project.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Bucket {
                        timestamps: VecDeque::new(),
                    }))
                })
                .clone()
        };

        let mut bucket = bucket.lock().await;
        let now = Instant::now();
        while let Some(oldest) = bucket.timestamps.front() {
            if now.duration_since(*oldest) > self.window {
                bucket.timestamps.pop_front();
            } else {
                break;
            }
        }

        if bucket.timestamps.len() >= self.count as usize {
            let oldest = *bucket.timestamps.front().expect("bucket is non-empty");
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(ToolError::RateLimitExceeded {
                retry_after_seconds: retry_after.as_secs().max(1),
            });
        }

        bucket.timestamps.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_count_within_window() {
        let limiter = RateLimiter::new(3, 60);
        for _ in 0..3 {
            limiter.check("demo").await.unwrap();
        }
        let err = limiter.check("demo").await.unwrap_err();
        match err {
            ToolError::RateLimitExceeded {
                retry_after_seconds,
            } => {
                assert!(retry_after_seconds >= 1 && retry_after_seconds <= 60);
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn buckets_are_per_project() {
        let limiter = RateLimiter::new(1, 60);
        limiter.check("alpha").await.unwrap();
        // A different project has its own budget.
        limiter.check("beta").await.unwrap();
        assert!(limiter.check("alpha").await.is_err());
    }

    #[tokio::test]
    async fn zero_count_disables_limiting() {
        let limiter = RateLimiter::new(0, 60);
        for _ in 0..100 {
            limiter.check("demo").await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_restores_budget() {
        let limiter = RateLimiter::new(1, 1);
        limiter.check("demo").await.unwrap();
        assert!(limiter.check("demo").await.is_err());

        tokio::time::advance(Duration::from_millis(1100)).await;
        // Instant::now() under start_paused advances with the test clock.
        limiter.check("demo").await.unwrap();
    }
}
