//! Per-claim retry backoff for the controller's error policy
//!
//! Each failed reconciliation doubles the delay before the claim is retried:
//! `base * 2^failures`, capped at `max`. A successful reconciliation or a
//! claim deletion resets the count. There is no retry limit.

use std::time::Duration;

use dashmap::DashMap;

use crate::key::ClaimKey;

/// Initial per-claim retry delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Per-claim retry delay ceiling
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Failure counts keyed by claim
#[derive(Debug)]
pub struct RetryBackoff {
    failures: DashMap<ClaimKey, u32>,
    base: Duration,
    max: Duration,
}

impl RetryBackoff {
    /// Backoff with the given base delay and ceiling
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: DashMap::new(),
            base,
            max,
        }
    }

    /// Delay before the next retry of `key`; counts one more failure
    pub fn next_delay(&self, key: &ClaimKey) -> Duration {
        let mut failures = self.failures.entry(key.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        // 2^31 * 5ms already exceeds any sane ceiling
        let factor = 1u32.checked_shl(exp.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Failures recorded for `key` since the last [`forget`](Self::forget)
    pub fn failures(&self, key: &ClaimKey) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }

    /// Reset the retry history of `key`
    pub fn forget(&self, key: &ClaimKey) {
        self.failures.remove(key);
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}
