//! Reconnect Backoff
//!
//! Exponential backoff for edge reconnects. Retries are unlimited; only the
//! delay is bounded.
//!
//! - Failure 1: `base`
//! - Failure 2: `2 * base`
//! - Failure 3: `4 * base`
//! - Capped at `max`
//!
//! No jitter is applied, so within one failure streak the delay never
//! shrinks.

use std::time::Duration;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base: Duration,
    /// Cap for exponential growth
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    /// Delay to wait after the `failures`-th consecutive failure (1-indexed).
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(failures - 1);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Failure-streak tracker.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.config.delay_for(self.failures)
    }

    /// Clear the streak after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures in the current streak.
    pub fn attempts(&self) -> u32 {
        self.failures
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let cfg = config(100, 1000);

        assert_eq!(cfg.delay_for(0), Duration::ZERO);
        assert_eq!(cfg.delay_for(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(400));
        assert_eq!(cfg.delay_for(4), Duration::from_millis(800));
        assert_eq!(cfg.delay_for(5), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for(50), Duration::from_millis(1000));
    }

    #[test]
    fn test_three_failures_are_monotonic_and_bounded() {
        let mut backoff = Backoff::new(config(250, 600));

        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();

        assert!(d1 <= d2 && d2 <= d3);
        assert!(d3 <= Duration::from_millis(600));
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_reset_restarts_streak() {
        let mut backoff = Backoff::new(config(100, 10_000));

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_long_streak_never_overflows() {
        let mut backoff = Backoff::new(config(1, 5_000));
        let mut last = Duration::ZERO;

        for _ in 0..200 {
            let delay = backoff.next_delay();
            assert!(delay >= last);
            assert!(delay <= Duration::from_millis(5_000));
            last = delay;
        }
    }
}
