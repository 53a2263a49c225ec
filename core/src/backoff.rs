//! Reconnect backoff: exponential growth with multiplicative jitter.

use std::time::Duration;

use crate::config::BackoffConfig;

/// `base = min(max_ms, min_ms * 2^(attempt-1))`, then scaled by a
/// random factor in `[1 - r, 1 + r]`.
pub struct Backoff {
    min_ms: u64,
    max_ms: u64,
    jitter_ratio: f64,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: &BackoffConfig) -> Self {
        Self {
            min_ms: cfg.min_ms,
            max_ms: cfg.max_ms,
            jitter_ratio: cfg.jitter_ratio,
            max_attempts: cfg.max_attempts,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// `None` once `max_attempts` has been exceeded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if let Some(max_attempts) = self.max_attempts {
            if self.attempt > max_attempts {
                return None;
            }
        }

        let exp = self.attempt.saturating_sub(1).min(32);
        let grown = (self.min_ms as f64) * 2f64.powi(exp as i32);
        let base = grown.min(self.max_ms as f64);

        let r = self.jitter_ratio.clamp(0.0, 1.0);
        let factor = (1.0 - r) + fastrand::f64() * (2.0 * r);
        let delay_ms = (base * factor).max(0.0);

        Some(Duration::from_millis(delay_ms as u64))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(min_ms: u64, max_ms: u64, jitter_ratio: f64, max_attempts: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            min_ms,
            max_ms,
            max_attempts,
            jitter_ratio,
        }
    }

    #[test]
    fn delay_stays_within_jittered_bounds() {
        let cfg = cfg(100, 10_000, 0.2, None);
        let mut backoff = Backoff::new(&cfg);
        for attempt in 1..=10u32 {
            let delay = backoff.next_delay().unwrap();
            let exp = attempt.saturating_sub(1) as i32;
            let base = (100.0 * 2f64.powi(exp)).min(10_000.0);
            let lower = (base * 0.8).floor() as u128;
            let upper = (base * 1.2).ceil() as u128;
            let millis = delay.as_millis();
            assert!(
                millis >= lower && millis <= upper,
                "attempt {attempt}: {millis}ms not in [{lower}, {upper}]"
            );
        }
    }

    #[test]
    fn caps_at_max_ms() {
        let cfg = cfg(1_000, 5_000, 0.0, None);
        let mut backoff = Backoff::new(&cfg);
        for _ in 0..20 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay.as_millis() <= 5_000);
        }
    }

    #[test]
    fn stops_after_max_attempts() {
        let cfg = cfg(100, 1_000, 0.0, Some(3));
        let mut backoff = Backoff::new(&cfg);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let cfg = cfg(100, 1_000, 0.0, None);
        let mut backoff = Backoff::new(&cfg);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
