//! Exponential retry backoff with jitter.

use std::time::Duration;

use keel_core::BackoffConfig;
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    jitter: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms.max(config.base_ms)),
            max_attempts: config.max_attempts.max(1),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    ///
    /// `base * 2^(attempt - 1)`, capped at `max`.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Jittered delay. Jitter only shortens the nominal delay, so the cap holds.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let factor = 1.0 - self.jitter * rand::thread_rng().gen::<f64>();
        nominal.mul_f64(factor)
    }

    /// `true` once `attempts` failures have used up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn backoff(jitter: f64) -> Backoff {
        Backoff::new(&BackoffConfig {
            base_ms: 100,
            max_ms: 1_000,
            max_attempts: 3,
            jitter,
        })
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(4, 800)]
    #[case(5, 1_000)]
    #[case(40, 1_000)]
    fn nominal_doubles_then_caps(#[case] attempt: u32, #[case] millis: u64) {
        assert_eq!(backoff(0.0).nominal(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let b = backoff(0.5);
        for _ in 0..100 {
            let d = b.delay(3);
            assert!(d <= Duration::from_millis(400));
            assert!(d >= Duration::from_millis(200));
        }
    }

    #[test]
    fn exhausted_at_max_attempts() {
        let b = backoff(0.0);
        assert!(!b.exhausted(2));
        assert!(b.exhausted(3));
    }
}
