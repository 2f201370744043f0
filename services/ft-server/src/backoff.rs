//! Retry delays shared by message resends and recovery attempts.

use std::time::Duration;

use rand::Rng;

/// Doubling delay with an upper bound and optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Same delay every time.
    pub fn constant(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        let delay = self.base.saturating_mul(factor).min(self.max);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let scale = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(scale)
    }
}
