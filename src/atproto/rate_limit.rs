//! Client-side request pacing
//!
//! The service enforces per-account request budgets. Requests are counted in
//! fixed windows per bucket; once a bucket's budget is spent, callers wait for
//! the window to roll over instead of collecting 429 responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppError;

/// Rate limiter entry
#[derive(Debug, Clone)]
struct RateLimitEntry {
    /// Number of requests in current window
    count: u32,
    /// Window start time
    window_start: Instant,
}

impl RateLimitEntry {
    /// Check if this entry is in a new window
    fn is_new_window(&self, window_duration: Duration) -> bool {
        self.window_start.elapsed() >= window_duration
    }

    /// Increment count or reset if new window
    fn increment(&mut self, window_duration: Duration) {
        if self.is_new_window(window_duration) {
            self.count = 1;
            self.window_start = Instant::now();
        } else {
            self.count += 1;
        }
    }

    fn remaining(&self, window_duration: Duration) -> Duration {
        window_duration.saturating_sub(self.window_start.elapsed())
    }
}

/// Fixed-window limiter keyed by request bucket (e.g. "read", "write")
pub struct RateLimiter {
    /// Rate limit entries: bucket -> entry
    entries: Arc<RwLock<HashMap<String, RateLimitEntry>>>,
    /// Maximum requests per window
    max_requests: u32,
    /// Window duration
    window_duration: Duration,
}

impl RateLimiter {
    /// Create new rate limiter
    ///
    /// # Arguments
    /// * `max_requests` - Maximum requests per window
    /// * `window_duration` - Window duration
    pub fn new(max_requests: u32, window_duration: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_requests: max_requests.max(1),
            window_duration,
        }
    }

    /// Count a request against `key` if the budget allows it
    ///
    /// # Returns
    /// `RateLimited` if the current window is exhausted
    pub async fn check_and_increment(&self, key: &str) -> Result<(), AppError> {
        let mut entries = self.entries.write().await;

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                window_start: Instant::now(),
            });

        if !entry.is_new_window(self.window_duration) && entry.count >= self.max_requests {
            Err(AppError::RateLimited)
        } else {
            entry.increment(self.window_duration);
            Ok(())
        }
    }

    /// Time until the current window of `key` rolls over
    pub async fn time_until_reset(&self, key: &str) -> Duration {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|e| e.remaining(self.window_duration))
            .unwrap_or(Duration::ZERO)
    }

    /// Wait until a request against `key` is allowed, then count it
    pub async fn acquire(&self, key: &str) {
        while self.check_and_increment(key).await.is_err() {
            let wait = self.time_until_reset(key).await;
            tracing::warn!(
                bucket = key,
                wait_ms = wait.as_millis() as u64,
                "Request budget exhausted, waiting for next window"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Get current count for a key
    pub async fn get_count(&self, key: &str) -> u32 {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| !e.is_new_window(self.window_duration))
            .map(|e| e.count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allows_requests_within_budget() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            assert!(limiter.check_and_increment("read").await.is_ok());
        }
        assert!(matches!(
            limiter.check_and_increment("read").await,
            Err(AppError::RateLimited)
        ));
        assert_eq!(limiter.get_count("read").await, 3);
    }

    #[tokio::test]
    async fn test_buckets_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));

        limiter.check_and_increment("read").await.unwrap();
        assert!(limiter.check_and_increment("write").await.is_ok());
        assert!(limiter.check_and_increment("read").await.is_err());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_next_window() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50));

        limiter.acquire("write").await;
        let started = Instant::now();
        limiter.acquire("write").await;
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(limiter.get_count("write").await, 1);
    }
}
