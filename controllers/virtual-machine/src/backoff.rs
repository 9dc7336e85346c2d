//! # Exponential Backoff
//!
//! Provides the retry delay used by the work queue when a reconciliation
//! pass fails. Each consecutive failure multiplies the delay by `factor`,
//! starting at `base` and capped at `max`.
//!
//! Default sequence: 1s, 2s, 4s, 8s, ... 256s, 300s (max).

use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay
    base: Duration,
    /// Multiplier applied per failure
    factor: u32,
    /// Upper bound for any delay
    max: Duration,
    /// Failures seen by the stateful API
    attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2, Duration::from_secs(300))
    }
}

impl ExponentialBackoff {
    /// Create a new backoff
    ///
    /// # Arguments
    ///
    /// * `base` - Delay after the first failure (typically 1s)
    /// * `factor` - Growth factor per failure (typically 2)
    /// * `max` - Cap for the sequence (typically 5 minutes)
    #[must_use]
    pub fn new(base: Duration, factor: u32, max: Duration) -> Self {
        Self {
            base,
            factor: factor.max(1),
            max: max.max(base),
            attempts: 0,
        }
    }

    /// Maximum delay
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Calculate the delay after `failures` consecutive failures (stateless)
    ///
    /// `failures` is 1-based: the first failure waits `base`. Zero failures
    /// means no delay.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let mut delay = self.base;
        for _ in 1..failures {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max {
                return self.max;
            }
        }
        delay.min(self.max)
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.delay_for(self.attempts)
    }

    /// Reset the backoff after a success
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
