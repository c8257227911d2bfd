//! Retry & backoff policy.
//!
//! Pure, database-free math so it can be unit-tested without a store: given
//! a strategy, a base delay, a cap, and the attempt number, compute how long
//! to wait before the next claim is eligible. Jitter is applied separately
//! so callers can assert on the un-jittered delay in tests.

use std::time::Duration;

/// How the delay grows with each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `delay = base_delay` regardless of attempt.
    Fixed,
    /// `delay = base_delay * attempt`.
    Linear,
    /// `delay = base_delay * 2^(attempt - 1)`.
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

/// Compute the base (pre-jitter) retry delay for the given 1-based attempt
/// number, capped at `max_delay`.
pub fn compute_delay(
    base_delay: Duration,
    max_delay: Duration,
    strategy: BackoffStrategy,
    attempt: u32,
) -> Duration {
    let attempt = attempt.max(1);
    let multiplier: f64 = match strategy {
        BackoffStrategy::Fixed => 1.0,
        BackoffStrategy::Linear => attempt as f64,
        BackoffStrategy::Exponential => 2f64.powi(attempt as i32 - 1),
    };
    let delay_ms = (base_delay.as_millis() as f64) * multiplier;
    let capped_ms = delay_ms.min(max_delay.as_millis() as f64);
    Duration::from_millis(capped_ms.max(0.0) as u64)
}

/// Add uniform jitter in `[0, 0.1 * delay)` on top of a computed delay.
pub fn with_jitter(delay: Duration) -> Duration {
    let jitter_ms = (delay.as_millis() as f64) * 0.1 * fastrand::f64();
    delay + Duration::from_millis(jitter_ms as u64)
}

/// Convenience: compute the delay and apply jitter in one call.
pub fn next_delay(
    base_delay: Duration,
    max_delay: Duration,
    strategy: BackoffStrategy,
    attempt: u32,
) -> Duration {
    with_jitter(compute_delay(base_delay, max_delay, strategy, attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_strategy_is_constant() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(3600);
        for attempt in 1..=5 {
            assert_eq!(compute_delay(base, cap, BackoffStrategy::Fixed, attempt), base);
        }
    }

    #[test]
    fn linear_strategy_scales_by_attempt() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(3600);
        assert_eq!(
            compute_delay(base, cap, BackoffStrategy::Linear, 3),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn exponential_strategy_doubles() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(3600);
        assert_eq!(
            compute_delay(base, cap, BackoffStrategy::Exponential, 1),
            Duration::from_millis(100)
        );
        assert_eq!(
            compute_delay(base, cap, BackoffStrategy::Exponential, 2),
            Duration::from_millis(200)
        );
        assert_eq!(
            compute_delay(base, cap, BackoffStrategy::Exponential, 3),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn exponential_strategy_is_capped() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(250);
        assert_eq!(
            compute_delay(base, cap, BackoffStrategy::Exponential, 10),
            cap
        );
    }

    #[test]
    fn jitter_never_decreases_delay_and_stays_under_ten_percent() {
        let delay = Duration::from_millis(1000);
        for _ in 0..50 {
            let jittered = with_jitter(delay);
            assert!(jittered >= delay);
            assert!(jittered < delay + Duration::from_millis(101));
        }
    }

    #[test]
    fn attempt_zero_is_treated_as_one() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(3600);
        assert_eq!(
            compute_delay(base, cap, BackoffStrategy::Exponential, 0),
            compute_delay(base, cap, BackoffStrategy::Exponential, 1)
        );
    }
}
