// ABOUTME: Retry policy - pure backoff delay calculation for reconnects and resubscribes
//
// The policy never sleeps and keeps no attempt counter; callers own the loop
// and ask for the delay of attempt N.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_ms;

/// Immutable retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failure; attempts `0..max_retries` are retried
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    /// Double per attempt instead of growing linearly
    pub exponential: bool,

    /// Cap on any single delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32, base_delay: Duration, exponential: bool, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            exponential,
            max_delay,
        }
    }

    /// 3 retries, 1 s doubling up to 30 s.
    #[must_use]
    pub const fn standard() -> Self {
        Self::new(3, Duration::from_secs(1), true, Duration::from_secs(30))
    }

    /// 10 retries, 500 ms doubling up to 60 s.
    #[must_use]
    pub const fn aggressive() -> Self {
        Self::new(10, Duration::from_millis(500), true, Duration::from_secs(60))
    }

    /// 3 retries, 2 s growing linearly up to 60 s.
    #[must_use]
    pub const fn conservative() -> Self {
        Self::new(3, Duration::from_secs(2), false, Duration::from_secs(60))
    }

    /// Fail on the first error.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, false, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (0-indexed).
    ///
    /// Linear: `min(base * (attempt + 1), max)`.
    /// Exponential: `min(base * 2^attempt, max)`.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = if self.exponential {
            2u64.saturating_pow(attempt)
        } else {
            u64::from(attempt).saturating_add(1)
        };
        // millis beyond u64::MAX are capped by max_delay anyway
        let base_millis = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_millis.saturating_mul(multiplier));
        std::cmp::min(delay, self.max_delay)
    }

    /// Whether a failure on `attempt` (0-indexed) should be retried.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
