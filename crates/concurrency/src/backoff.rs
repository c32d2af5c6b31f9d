//! Exponential backoff with full jitter.
//!
//! Given `(min, max, factor)`, the kth call returns a uniform random integer
//! number of milliseconds in `[0, min(max, min * factor^k)]`. A fresh,
//! OS-seeded generator is drawn per call so concurrent callers never
//! contend on shared RNG state.

use rand::Rng;
use std::time::Duration;

/// Exponential-backoff-with-full-jitter delay calculator.
#[derive(Debug, Clone, Copy)]
pub struct BackoffCalculator {
    min: Duration,
    max: Duration,
    factor: f64,
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_millis(60_000),
            factor: 2.0,
        }
    }
}

impl BackoffCalculator {
    /// Build a calculator with explicit bounds. Values of zero fall back to
    /// the defaults (100ms / 60s / 2.0), matching the original's
    /// constructor semantics.
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        let default = Self::default();
        Self {
            min: if min.is_zero() { default.min } else { min },
            max: if max.is_zero() { default.max } else { max },
            factor: if factor > 0.0 { factor } else { default.factor },
        }
    }

    /// The delay for the kth retry attempt. Never fails; always returns a
    /// finite value in `[0, min(max, min * factor^k)]`.
    pub fn delay_for(&self, retry_attempts: u32) -> Duration {
        let min_ms = self.min.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let uncapped = min_ms * self.factor.powi(retry_attempts as i32);
        let cap_ms = max_ms.min(uncapped).round().max(0.0) as u64;

        let jittered = if cap_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=cap_ms)
        };
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delay_never_exceeds_cap() {
        let calc = BackoffCalculator::default();
        for k in 0..10 {
            let cap_ms = 60_000u128.min((100f64 * 2f64.powi(k as i32)).round() as u128);
            let d = calc.delay_for(k);
            assert!(d.as_millis() <= cap_ms, "k={k} delay={d:?} cap={cap_ms}");
        }
    }

    #[test]
    fn zero_bounds_fall_back_to_defaults() {
        let calc = BackoffCalculator::new(Duration::ZERO, Duration::ZERO, 0.0);
        let default = BackoffCalculator::default();
        assert_eq!(calc.max.as_millis(), default.max.as_millis());
        assert_eq!(calc.min.as_millis(), default.min.as_millis());
    }

    proptest! {
        #[test]
        fn delay_always_falls_within_min_max_factor_range(
            min_ms in 1u64..5_000,
            max_ms in 5_000u64..120_000,
            factor in 1.0f64..4.0,
            retry_attempts in 0u32..20,
        ) {
            let calc = BackoffCalculator::new(
                Duration::from_millis(min_ms),
                Duration::from_millis(max_ms),
                factor,
            );
            let cap_ms = (max_ms as f64).min(min_ms as f64 * factor.powi(retry_attempts as i32));
            let cap_ms = cap_ms.round().max(0.0) as u128;
            let d = calc.delay_for(retry_attempts);
            prop_assert!(d.as_millis() <= cap_ms);
        }
    }
}
