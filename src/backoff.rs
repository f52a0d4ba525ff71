//! # Reconnect backoff
//!
//! The delay before reconnect attempt `n` (0-indexed) is `delay × factor^n`,
//! clamped to `max`. With the default factor of `1.0` every attempt waits the
//! same configured delay.

use std::time::Duration;

use crate::config::PubSubConfig;

/// Delay schedule for reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first attempt
    pub delay: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor per attempt
    pub factor: f64,
}

impl RetryPolicy {
    /// Schedule described by a configuration
    pub fn from_config(config: &PubSubConfig) -> Self {
        Self {
            delay: config.retry_delay(),
            max: config.max_retry_delay().max(config.retry_delay()),
            factor: config.retry_backoff_factor,
        }
    }

    /// Delay to wait before the given attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.delay.as_secs_f64() * self.factor.powi(exponent);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(delay_ms: u64, max_ms: u64, factor: f64) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(delay_ms),
            max: Duration::from_millis(max_ms),
            factor,
        }
    }

    #[test]
    fn test_fixed_delay_by_default() {
        let policy = RetryPolicy::from_config(&PubSubConfig::default());
        for attempt in 0..20 {
            assert_eq!(policy.delay_for(attempt), Duration::from_secs(3));
        }
    }

    #[test]
    fn test_escalating_delay() {
        let policy = policy(100, 1_000, 2.0);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_from_config_never_caps_below_delay() {
        let config = PubSubConfig {
            retry_delay_ms: 500,
            max_retry_delay_ms: 100,
            ..PubSubConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
    }
}
