//! Bounded waits for lock acquisition.
//!
//! A caller that is still refused after `retry_attempts` extra tries gets
//! "busy" and leaves the work to the next scheduled invocation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Wait before the first retry; doubles per retry.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: Duration,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: Duration,
}

const fn default_retry_attempts() -> u32 {
    3
}

const fn default_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(2)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_backoff: default_retry_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            retry_attempts: 0,
            ..Self::default()
        }
    }

    /// Same wait before every retry.
    pub fn fixed(retry_attempts: u32, delay: Duration) -> Self {
        Self {
            retry_attempts,
            retry_backoff: delay,
            max_backoff: delay,
        }
    }

    /// Wait before retry number `retry` (1-based). Zero for `retry == 0`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let Some(shift) = retry.checked_sub(1) else {
            return Duration::ZERO;
        };
        let factor = 1u32.checked_shl(shift.min(31)).unwrap_or(u32::MAX);
        self.retry_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// `attempts_made` counts retries already spent, not the first try.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.retry_attempts
    }
}
