//! Exponential backoff with jitter for failed jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use jobq_core::defaults;

use crate::WorkerConfig;

/// Backoff schedule applied between attempts of one job.
///
/// The delay after attempt `n` is `base * multiplier^(n-1)`, jittered by a
/// uniform factor in `[0.8, 1.2]` and capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(defaults::JOB_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::JOB_RETRY_MAX_DELAY_MS),
            multiplier: defaults::JOB_RETRY_MULTIPLIER,
        }
    }
}

impl From<&WorkerConfig> for RetryPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            multiplier: config.retry_backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
        }
    }

    /// Un-jittered delay after `attempts` attempts, capped at `max_delay`.
    pub fn base_delay_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).max(0);
        let factor = self.multiplier.powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Jittered delay after `attempts` attempts. Never exceeds `max_delay`.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let jitter = rand::thread_rng()
            .gen_range(defaults::JOB_RETRY_JITTER_MIN..=defaults::JOB_RETRY_JITTER_MAX);
        let secs = self.base_delay_for(attempts).as_secs_f64() * jitter;
        Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Absolute time at which the job becomes eligible again.
    ///
    /// Saturates at the latest representable timestamp for absurd delays.
    pub fn retry_after(&self, now: DateTime<Utc>, attempts: i32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay_for(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(300), 2.0)
    }

    #[test]
    fn test_base_delay_grows_exponentially() {
        let p = policy();
        assert_eq!(p.base_delay_for(1), Duration::from_secs(1));
        assert_eq!(p.base_delay_for(2), Duration::from_secs(2));
        assert_eq!(p.base_delay_for(3), Duration::from_secs(4));
        assert_eq!(p.base_delay_for(5), Duration::from_secs(16));
    }

    #[test]
    fn test_base_delay_caps_at_max() {
        let p = policy();
        assert_eq!(p.base_delay_for(10), Duration::from_secs(300));
        assert_eq!(p.base_delay_for(i32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_zero_attempts_uses_base() {
        assert_eq!(policy().base_delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy();
        for attempts in 1..=4 {
            let base = p.base_delay_for(attempts).as_secs_f64();
            for _ in 0..200 {
                let d = p.delay_for(attempts).as_secs_f64();
                assert!(d >= base * 0.8 - 1e-6, "attempt {attempts}: {d} < {}", base * 0.8);
                assert!(d <= base * 1.2 + 1e-6, "attempt {attempts}: {d} > {}", base * 1.2);
            }
        }
    }

    #[test]
    fn test_jittered_delay_never_exceeds_cap() {
        let p = policy();
        for _ in 0..200 {
            assert!(p.delay_for(20) <= Duration::from_secs(300));
        }
    }

    #[test]
    fn test_retry_after_is_in_future() {
        let now = Utc::now();
        let at = policy().retry_after(now, 1);
        assert!(at >= now + chrono::Duration::milliseconds(799));
        assert!(at <= now + chrono::Duration::milliseconds(1201));
    }

    #[test]
    fn test_retry_after_saturates_for_huge_delays() {
        let huge = Duration::from_secs(u64::MAX);
        let p = RetryPolicy::new(huge, huge, 2.0);
        let now = Utc::now();
        assert_eq!(p.retry_after(now, 3), DateTime::<Utc>::MAX_UTC);

        let decades = RetryPolicy::new(
            Duration::from_secs(400 * 365 * 86_400),
            Duration::from_secs(400 * 365 * 86_400),
            2.0,
        );
        assert!(decades.retry_after(now, 1) > now);
    }

    #[test]
    fn test_policy_from_config() {
        let config = WorkerConfig::default().with_retry_backoff(
            Duration::from_secs(1),
            Duration::from_secs(5),
            3.0,
        );
        let p = RetryPolicy::from(&config);
        assert_eq!(p.base_delay_for(2), Duration::from_secs(3));
        assert_eq!(p.base_delay_for(3), Duration::from_secs(5));
    }
}
