//! Retry backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff: `base_delay * 2^retry_count`, capped at `max_delay`.
///
/// With the default one-minute base the first retry waits 1 min, the second
/// 2 min, the third 4 min.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the retry that follows failure number `retry_count + 1`.
    ///
    /// `retry_count` is the number of retries already scheduled (0 for the first failure).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        1u32.checked_shl(retry_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
