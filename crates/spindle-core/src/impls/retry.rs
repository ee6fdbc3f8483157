//! Retry policy for transient store failures (locked / busy database).

use std::time::Duration;

use rand::Rng;

/// Backoff between attempts of one store operation.
///
/// delay = base_delay * multiplier^attempt + uniform(0, jitter)
///
/// With the defaults (100ms, x2, 50ms jitter, 5 attempts):
/// - retry after attempt 0: 100ms..150ms
/// - attempt 1: 200ms..250ms
/// - attempt 2: 400ms..450ms
/// - attempt 3: 800ms..850ms
#[derive(Debug, Clone)]
pub struct StoreRetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: Duration::from_millis(50),
            max_attempts: 5,
        }
    }
}

impl StoreRetryPolicy {
    /// No retries; the first busy error is returned.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Should attempt `attempt` (0-indexed, already failed) be followed by another?
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Delay after the failed attempt `attempt` (0-indexed).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_secs = if self.jitter.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..self.jitter.as_secs_f64())
        };
        Duration::from_secs_f64(base_secs + jitter_secs)
    }
}
