//! Retry delay computation.

use std::time::Duration;

use rand::Rng;

/// Default delay before the first retry (3 seconds).
pub const DEFAULT_BASE_DELAY_MS: u64 = 3_000;

/// Default ceiling on any retry delay (5 minutes).
pub const DEFAULT_MAX_DELAY_MS: u64 = 300_000;

/// Default growth factor between retries.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default jitter fraction added on top of the computed delay.
pub const DEFAULT_JITTER: f64 = 0.2;

/// Longest server-requested wait honoured before the next attempt (1 hour).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3_600);

/// Exponential backoff with a cap and additive jitter.
///
/// For a record that has failed `n` times (`n >= 1`), the un-jittered delay is
/// `base * multiplier^(n-1)`, capped at `max_delay`. Jitter adds a uniform
/// random fraction in `[0, jitter)` of that delay, so the un-jittered part is
/// monotonically non-decreasing in `n`.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            ..Self::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            DEFAULT_BACKOFF_MULTIPLIER
        };
        self
    }

    /// Jitter fraction, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Parse a compact policy string `E,<base_ms>,<max_ms>,<multiplier>,<jitter>`.
    ///
    /// Only the exponential kind `E` is supported. A jitter value above 1 is
    /// read as a percentage hint and clamped to 1.
    ///
    /// ```
    /// use eventline::transport::BackoffPolicy;
    /// let policy = BackoffPolicy::from_config_str("E,3000,300000,2,1").unwrap();
    /// assert_eq!(policy.base_delay().as_millis(), 3000);
    /// ```
    pub fn from_config_str(value: &str) -> Result<Self, String> {
        let parts: Vec<&str> = value.split(',').map(str::trim).collect();
        if parts.len() != 5 {
            return Err(format!("expected 5 comma-separated fields, got {}", parts.len()));
        }
        if !parts[0].eq_ignore_ascii_case("E") {
            return Err(format!("unsupported backoff kind '{}'", parts[0]));
        }
        let base_ms: u64 = parts[1]
            .parse()
            .map_err(|_| format!("invalid base delay '{}'", parts[1]))?;
        let max_ms: u64 = parts[2]
            .parse()
            .map_err(|_| format!("invalid max delay '{}'", parts[2]))?;
        let multiplier: f64 = parts[3]
            .parse()
            .map_err(|_| format!("invalid multiplier '{}'", parts[3]))?;
        let jitter: f64 = parts[4]
            .parse()
            .map_err(|_| format!("invalid jitter '{}'", parts[4]))?;

        Ok(Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
            .with_multiplier(multiplier)
            .with_jitter(jitter))
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Delay before the next attempt, without jitter.
    ///
    /// `retry_count` is the number of failures so far; zero means no delay.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_count - 1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let delay_ms = self.base_delay.as_millis() as f64 * factor;
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before the next attempt, with jitter from `rng`.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay_for(retry_count);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let fraction: f64 = rng.random_range(0.0..self.jitter);
        delay + delay.mul_f64(fraction)
    }

    /// Delay before the next attempt, with thread-local jitter.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.delay_with_rng(retry_count, &mut rand::rng())
    }

    /// Delay honoring a server-provided floor.
    ///
    /// A rate-limit hint is the minimum wait; the computed backoff still
    /// applies when it is longer.
    pub fn delay_with_floor(&self, retry_count: u32, floor: Option<Duration>) -> Duration {
        let delay = self.delay_for(retry_count);
        match floor {
            Some(floor) => delay.max(floor.min(MAX_RETRY_AFTER)),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(), Duration::from_secs(3));
        assert_eq!(policy.max_delay(), Duration::from_secs(300));
        assert_eq!(policy.multiplier(), 2.0);
    }

    #[test]
    fn test_exponential_growth() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(policy.base_delay_for(0), Duration::ZERO);
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.base_delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.base_delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::new(Duration::from_millis(1000), Duration::from_secs(60))
            .with_jitter(0.5);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let d = policy.delay_with_rng(1, &mut rng);
            assert!(d >= Duration::from_millis(1000));
            assert!(d < Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = BackoffPolicy::default().with_jitter(0.0);
        assert_eq!(policy.delay_for(2), policy.base_delay_for(2));
    }

    #[test]
    fn test_floor_raises_delay() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_secs(1))
            .with_jitter(0.0);
        assert_eq!(
            policy.delay_with_floor(1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.delay_with_floor(1, Some(Duration::from_millis(1))),
            Duration::from_millis(10)
        );
        assert_eq!(policy.delay_with_floor(1, None), Duration::from_millis(10));
    }

    #[test]
    fn test_floor_capped_at_max_retry_after() {
        let policy = BackoffPolicy::default().with_jitter(0.0);
        assert_eq!(
            policy.delay_with_floor(1, Some(Duration::from_secs(9_223_372_036_854_775))),
            MAX_RETRY_AFTER
        );
    }

    #[test]
    fn test_from_config_str() {
        let policy = BackoffPolicy::from_config_str("E,3000,300000,2,1").unwrap();
        assert_eq!(policy.base_delay(), Duration::from_millis(3000));
        assert_eq!(policy.max_delay(), Duration::from_millis(300_000));
        assert_eq!(policy.multiplier(), 2.0);
        assert_eq!(policy.jitter(), 1.0);

        let policy = BackoffPolicy::from_config_str(" e , 500, 1000, 1.5, 0.1 ").unwrap();
        assert_eq!(policy.base_delay(), Duration::from_millis(500));
        assert_eq!(policy.multiplier(), 1.5);
    }

    #[test]
    fn test_from_config_str_rejects_garbage() {
        assert!(BackoffPolicy::from_config_str("").is_err());
        assert!(BackoffPolicy::from_config_str("L,1,2,3,4").is_err());
        assert!(BackoffPolicy::from_config_str("E,abc,2,3,4").is_err());
        assert!(BackoffPolicy::from_config_str("E,1,2,3").is_err());
    }

    #[test]
    fn test_max_below_base_is_raised() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.max_delay(), Duration::from_secs(5));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_unjittered_delay_is_monotonic(
                base_ms in 1u64..10_000,
                cap_ms in 1u64..1_000_000,
                multiplier in 1.0f64..4.0,
                retry in 0u32..64,
            ) {
                let policy = BackoffPolicy::new(
                    Duration::from_millis(base_ms),
                    Duration::from_millis(cap_ms),
                )
                .with_multiplier(multiplier);
                let a = policy.base_delay_for(retry);
                let b = policy.base_delay_for(retry + 1);
                prop_assert!(a <= b);
                prop_assert!(b <= policy.max_delay());
            }
        }
    }
}
