use std::time::Duration;

use rand::Rng;

const RECONNECT_CEILING_MS: u64 = 25_000;
const RECONNECT_FLOOR_MS: u64 = 250;
const RECONNECT_STEP_MS: u64 = 2_000;
const RECONNECT_BASE_MS: u64 = 500;

/// Randomized, linearly growing reconnect backoff capped at 25 seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconnectBackoff;

impl ReconnectBackoff {
    /// Delay window `[min, max)` in milliseconds for the Nth consecutive failure.
    pub fn bounds(consecutive_failures: u32) -> (u64, u64) {
        let n = u64::from(consecutive_failures);
        let max = RECONNECT_BASE_MS
            .saturating_add(n.saturating_mul(RECONNECT_STEP_MS))
            .min(RECONNECT_CEILING_MS);
        let min = n
            .saturating_sub(1)
            .saturating_mul(RECONNECT_STEP_MS)
            .max(RECONNECT_FLOOR_MS)
            .min(RECONNECT_CEILING_MS);
        (min, max)
    }

    /// Draw a delay for the Nth consecutive failure.
    pub fn delay(consecutive_failures: u32) -> Duration {
        Self::delay_with(consecutive_failures, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(consecutive_failures: u32, rng: &mut R) -> Duration {
        let (min, max) = Self::bounds(consecutive_failures);
        if min >= max {
            return Duration::from_millis(max);
        }
        Duration::from_millis(rng.gen_range(min..max))
    }
}

/// Capped retry for frames the client could not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseRetryPolicy {
    base_delay_ms: u64,
    max_attempts: u32,
}

impl ParseRetryPolicy {
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the next retry given the retries already made, or `None`
    /// once the limit is hit.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let attempt = u64::from(attempt);
        Some(Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(attempt.saturating_mul(attempt)),
        ))
    }
}

impl Default for ParseRetryPolicy {
    fn default() -> Self {
        Self::new(500, 3)
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn first_failure_window_starts_at_floor() {
        assert_eq!(ReconnectBackoff::bounds(1), (250, 2_500));
        assert_eq!(ReconnectBackoff::bounds(2), (2_000, 4_500));
    }

    #[test]
    fn window_is_capped_at_ceiling() {
        assert_eq!(ReconnectBackoff::bounds(13), (24_000, 25_000));
        assert_eq!(ReconnectBackoff::bounds(40), (25_000, 25_000));
        assert_eq!(
            ReconnectBackoff::delay(40),
            Duration::from_millis(25_000)
        );
    }

    #[test]
    fn drawn_delays_stay_inside_the_window() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in 1..=20 {
            let (min, max) = ReconnectBackoff::bounds(n);
            for _ in 0..50 {
                let delay = ReconnectBackoff::delay_with(n, &mut rng).as_millis() as u64;
                assert!(delay >= min, "attempt {n}: {delay} < {min}");
                assert!(delay < max || min == max, "attempt {n}: {delay} >= {max}");
            }
        }
    }

    #[test]
    fn parse_retry_grows_quadratically_until_limit() {
        let policy = ParseRetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Some(Duration::ZERO));
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(2_000)));
        assert_eq!(policy.delay_for_attempt(3), None);
    }
}
