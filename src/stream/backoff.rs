//! Exponential backoff between consumer loop recoveries.
//!
//! After a failure the loop waits `initial_delay * multiplier^attempt`, capped
//! at `max_delay`, before re-entering group setup. The attempt counter resets
//! once the loop makes progress again.

use std::time::Duration;

/// Configuration for exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Maximum delay between retries (cap for exponential growth).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub multiplier: f64,
}

impl Backoff {
    /// Default backoff: 100ms, doubling, capped at 30s.
    pub const DEFAULT: Self = Self {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
    };

    /// Creates a new backoff configuration.
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Computes the delay for the given failure attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_cap() {
        let backoff = Backoff::DEFAULT;

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(8), Duration::from_millis(25_600));
        assert_eq!(backoff.delay_for_attempt(9), Duration::from_secs(30));
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        let backoff = Backoff::DEFAULT;
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn zero_delay_never_sleeps() {
        let backoff = Backoff::new(Duration::ZERO, Duration::ZERO, 2.0);
        assert_eq!(backoff.delay_for_attempt(5), Duration::ZERO);
    }
}
