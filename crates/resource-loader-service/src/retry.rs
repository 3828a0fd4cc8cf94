//! Backoff computation for retried loads.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryStrategy;

/// Maximum jitter added on top of a delay, as a fraction of the delay.
const MAX_JITTER: f64 = 0.3;

impl RetryStrategy {
    /// The delay before retry number `retry` (starting at 1), without jitter.
    ///
    /// Non-decreasing in `retry` and never above `max_delay`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let millis = self.delay.as_secs_f64() * 1000.0 * factor;
        let max_millis = self.max_delay.as_secs_f64() * 1000.0;
        if !millis.is_finite() || millis >= max_millis {
            return self.max_delay;
        }
        Duration::from_secs_f64(millis / 1000.0)
    }

    /// The delay before retry number `retry`, jittered when configured.
    pub fn delay_for<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let jittered = delay.mul_f64(1.0 + rng.random_range(0.0..=MAX_JITTER));
        jittered.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let strategy = RetryStrategy {
            count: 10,
            delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            jitter: false,
            max_delay: Duration::from_secs(5),
        };

        assert_eq!(strategy.base_delay(1), Duration::from_millis(100));
        assert_eq!(strategy.base_delay(2), Duration::from_millis(200));
        assert_eq!(strategy.base_delay(3), Duration::from_millis(400));

        let mut previous = Duration::ZERO;
        for retry in 1..=strategy.count {
            let delay = strategy.base_delay(retry);
            assert!(delay >= previous);
            assert!(delay <= strategy.max_delay);
            previous = delay;
        }
        assert_eq!(strategy.base_delay(10), strategy.max_delay);
        assert_eq!(strategy.base_delay(u32::MAX), strategy.max_delay);
    }

    #[test]
    fn test_jitter_bounds() {
        let strategy = RetryStrategy {
            delay: Duration::from_millis(1000),
            jitter: true,
            max_delay: Duration::from_millis(1200),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let delay = strategy.delay_for(1, &mut rng);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1200));
        }
    }
}
