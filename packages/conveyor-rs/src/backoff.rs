//! Retry backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capped exponential backoff with jitter.
///
/// The delay before attempt `n + 1`, after `n` failed attempts, is
/// `min(cap, base * factor^(n-1)) * jitter` where jitter is drawn
/// uniformly from `[jitter_min, jitter_max]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            factor: 2.0,
            cap: Duration::from_millis(10_000),
            jitter_min: 0.5,
            jitter_max: 1.5,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            base,
            factor,
            cap,
            ..Self::default()
        }
    }

    /// Delay before the next dispatch, given `attempts` completed so far.
    ///
    /// `attempts` is at least 1 when this is called (an entry only
    /// retries after it has failed once).
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63);
        let raw = self.base.as_millis() as f64 * self.factor.powi(exponent as i32);
        let capped = raw.min(self.cap.as_millis() as f64);
        let jitter = self.jitter_min + fastrand::f64() * (self.jitter_max - self.jitter_min);
        Duration::from_millis((capped * jitter).round() as u64)
    }

    /// The delay envelope for a given attempt count, before jitter.
    ///
    /// Exposed so callers can reason about worst-case scheduling without
    /// sampling the jitter distribution.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63);
        let raw = self.base.as_millis() as f64 * self.factor.powi(exponent as i32);
        Duration::from_millis(raw.min(self.cap.as_millis() as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(1_000),
            2.0,
            Duration::from_millis(10_000),
        )
    }

    #[test]
    fn first_retry_uses_base() {
        assert_eq!(policy().base_delay(1), Duration::from_millis(1_000));
    }

    #[test]
    fn second_retry_doubles() {
        assert_eq!(policy().base_delay(2), Duration::from_millis(2_000));
    }

    #[test]
    fn cap_bounds_growth() {
        assert_eq!(policy().base_delay(20), Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = policy();
        for attempts in 1..=5 {
            let base = p.base_delay(attempts).as_millis() as f64;
            for _ in 0..200 {
                let d = p.delay(attempts).as_millis() as f64;
                assert!(d >= base * 0.5 - 1.0, "delay {d} below band for {attempts}");
                assert!(d <= base * 1.5 + 1.0, "delay {d} above band for {attempts}");
            }
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let p = policy();
        assert_eq!(p.base_delay(u32::MAX), Duration::from_millis(10_000));
    }
}
