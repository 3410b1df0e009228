use std::cmp::min;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponentially growing delay between reconnect attempts, capped at a maximum. Growth is
///  configured in eighths to keep the arithmetic integral: 16/8 doubles the delay per attempt.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config_initial_delay: Duration,
    config_max_delay: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let result = ExponentialBackoff {
            config_initial_delay: config.initial_delay,
            config_max_delay: config.max_delay,
            config_factor_eighths: config.factor_eighths,
        };

        assert!(result.config_factor_eighths >= 8, "backoff must not shrink - config should have been validated");

        result
    }

    /// `min(initial * factor^attempt, max)`, with attempt 0 being the delay after the first
    ///  failure
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.config_initial_delay;
        for _ in 0..attempt {
            if delay >= self.config_max_delay {
                break;
            }
            let next = delay.saturating_mul(self.config_factor_eighths) / 8;
            if next == delay {
                break;
            }
            delay = next;
        }
        min(delay, self.config_max_delay)
    }
}
