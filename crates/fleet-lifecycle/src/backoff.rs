//! Exponential backoff over persisted [`RetryState`].
//!
//! The delay doubles from `base_secs` on every consecutive failure and is
//! capped at `max_secs`. The state lives in the record being retried so a
//! restart resumes the same schedule.

use fleet_state::RetryState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Backoff {
    pub base_secs: u64,
    pub max_secs: u64,
    /// Consecutive failures after which a warning event is emitted.
    pub warn_after: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_secs: 5,
            max_secs: 300,
            warn_after: 5,
        }
    }
}

impl Backoff {
    /// Delay after the `attempts`-th consecutive failure.
    pub fn delay(&self, attempts: u32) -> u64 {
        if attempts == 0 {
            return 0;
        }
        let shift = (attempts - 1).min(32);
        self.base_secs
            .saturating_mul(1u64 << shift)
            .min(self.max_secs)
    }

    /// Record one failure; returns the delay until the next attempt.
    pub fn record_failure(&self, retry: &mut RetryState, now: u64) -> u64 {
        retry.attempts = retry.attempts.saturating_add(1);
        let delay = self.delay(retry.attempts);
        retry.next_attempt_at = now + delay;
        delay
    }

    pub fn reset(&self, retry: &mut RetryState) {
        *retry = RetryState::default();
    }

    /// Seconds left before the next attempt is allowed, if any.
    pub fn wait_remaining(&self, retry: &RetryState, now: u64) -> Option<u64> {
        (retry.next_attempt_at > now).then(|| retry.next_attempt_at - now)
    }

    /// Whether the failure just recorded crossed the warning threshold.
    pub fn crossed_warning(&self, retry: &RetryState) -> bool {
        retry.attempts == self.warn_after
    }
}
