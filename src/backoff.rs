//! Exponential backoff with symmetric jitter.

use std::time::Duration;

use rand::Rng;

/// Base/max delay and jitter ratio shared by retry and poll loops.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl BackoffPolicy {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_ratio: 0.0,
        }
    }

    pub const fn standard() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
            jitter_ratio: 0.25,
        }
    }

    pub const fn base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub const fn max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = sanitize_jitter(jitter_ratio);
        self
    }

    pub const fn configured_base(&self) -> Duration {
        self.base
    }

    pub const fn configured_max(&self) -> Duration {
        self.max
    }

    pub const fn configured_jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        delay(attempt, self.base, self.max, self.jitter_ratio)
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, rng: &mut R, attempt: u32) -> Duration {
        delay_with(rng, attempt, self.base, self.max, self.jitter_ratio)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// `min(base * 2^attempt, max)` scaled by a uniform factor in
/// `[1 - jitter, 1 + jitter]`, clamped to `[0, max]`.
pub fn delay(attempt: u32, base: Duration, max: Duration, jitter_ratio: f64) -> Duration {
    delay_with(&mut rand::rng(), attempt, base, max, jitter_ratio)
}

pub fn delay_with<R: Rng + ?Sized>(
    rng: &mut R,
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
) -> Duration {
    let capped = exponential(attempt, base, max);
    let jitter_ratio = sanitize_jitter(jitter_ratio);
    if jitter_ratio <= f64::EPSILON || capped.is_zero() {
        return capped;
    }

    let unit: f64 = rng.random();
    let factor = (1.0 - jitter_ratio) + 2.0 * jitter_ratio * unit;
    let jittered_ms = (capped.as_secs_f64() * 1000.0 * factor).max(0.0);
    let max_ms = max.as_secs_f64() * 1000.0;
    Duration::from_secs_f64(jittered_ms.min(max_ms) / 1000.0)
}

fn exponential(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis();
    let max_ms = max.as_millis();
    let multiplier = 1_u128 << attempt.min(63);
    let delay_ms = base_ms
        .saturating_mul(multiplier)
        .min(max_ms)
        .min(u64::MAX as u128) as u64;
    Duration::from_millis(delay_ms)
}

fn sanitize_jitter(jitter_ratio: f64) -> f64 {
    if jitter_ratio.is_finite() {
        jitter_ratio.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{BackoffPolicy, delay, delay_with};

    #[test]
    fn zero_jitter_is_exact_exponential_capped_at_max() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        let expected = [100, 200, 400, 800, 1_000, 1_000];
        for (attempt, expected_ms) in expected.into_iter().enumerate() {
            assert_eq!(
                delay(attempt as u32, base, max, 0.0),
                Duration::from_millis(expected_ms)
            );
        }
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_millis(50);
        let max = Duration::from_millis(2_000);
        for attempt in 0..40 {
            for _ in 0..64 {
                let value = delay_with(&mut rng, attempt, base, max, 0.5);
                assert!(value <= max, "attempt {attempt} produced {value:?}");
                let nominal = base
                    .saturating_mul(1_u32 << attempt.min(20))
                    .min(max)
                    .as_secs_f64();
                assert!(value.as_secs_f64() >= nominal * 0.5 - 1e-9);
            }
        }
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_max() {
        let max = Duration::from_secs(30);
        assert_eq!(delay(u32::MAX, Duration::from_secs(1), max, 0.0), max);
    }

    #[test]
    fn out_of_range_jitter_is_clamped() {
        let mut rng = StdRng::seed_from_u64(11);
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40))
            .jitter_ratio(f64::NAN);
        assert_eq!(policy.configured_jitter_ratio(), 0.0);
        assert_eq!(policy.delay_with(&mut rng, 1), Duration::from_millis(20));

        let wide = policy.jitter_ratio(7.0);
        assert_eq!(wide.configured_jitter_ratio(), 1.0);
        for _ in 0..128 {
            assert!(wide.delay_with(&mut rng, 3) <= Duration::from_millis(40));
        }
    }
}
