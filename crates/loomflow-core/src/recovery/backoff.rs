//! Exponential retry backoff.

use rand::Rng;

/// Lower and upper bound of the jitter factor.
pub const JITTER_RANGE: (f64, f64) = (0.75, 1.25);

/// Stateless delay calculator for retrying handlers.
pub struct ExponentialBackoffCalculator;

impl ExponentialBackoffCalculator {
    /// `min(base * multiplier^attempt, max)` in milliseconds, optionally
    /// scaled by a uniform factor in [`JITTER_RANGE`].
    ///
    /// `attempt` is 0-based: the first retry waits `base_delay_ms`.
    pub fn calculate_delay(
        attempt: u32,
        base_delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
        jitter: bool,
    ) -> u64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = base_delay_ms as f64 * multiplier.max(0.0).powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(max_delay_ms as f64)
        } else {
            max_delay_ms as f64
        };
        if !jitter {
            return capped.round() as u64;
        }
        let factor = rand::thread_rng().gen_range(JITTER_RANGE.0..=JITTER_RANGE.1);
        (capped * factor).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unjittered_is_exactly_exponential() {
        assert_eq!(ExponentialBackoffCalculator::calculate_delay(0, 100, 2.0, 10_000, false), 100);
        assert_eq!(ExponentialBackoffCalculator::calculate_delay(1, 100, 2.0, 10_000, false), 200);
        assert_eq!(ExponentialBackoffCalculator::calculate_delay(3, 100, 2.0, 10_000, false), 800);
        assert_eq!(ExponentialBackoffCalculator::calculate_delay(2, 1000, 1.5, 60_000, false), 2250);
    }

    #[test]
    fn test_cap_holds_at_high_attempts() {
        assert_eq!(ExponentialBackoffCalculator::calculate_delay(10, 100, 2.0, 5_000, false), 5_000);
        assert_eq!(
            ExponentialBackoffCalculator::calculate_delay(5_000, 100, 2.0, 5_000, false),
            5_000
        );
        assert_eq!(
            ExponentialBackoffCalculator::calculate_delay(u32::MAX, 100, 10.0, 30_000, false),
            30_000
        );
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        for attempt in 0..8 {
            let base = ExponentialBackoffCalculator::calculate_delay(attempt, 200, 2.0, 20_000, false);
            for _ in 0..50 {
                let jittered =
                    ExponentialBackoffCalculator::calculate_delay(attempt, 200, 2.0, 20_000, true);
                let low = (base as f64 * 0.75).floor() as u64;
                let high = (base as f64 * 1.25).ceil() as u64;
                assert!(
                    (low..=high).contains(&jittered),
                    "attempt {attempt}: {jittered} outside [{low}, {high}]"
                );
            }
        }
    }
}
