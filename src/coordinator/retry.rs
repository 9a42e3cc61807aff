use crate::config::MergeConfig;
use crate::error::Error;
use std::time::Duration;

/// Retry budget for supervised tasks
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Re-executions granted after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &MergeConfig) -> Self {
        Self {
            max_retries: config.max_task_retries,
            initial_delay: config.retry_backoff,
            ..Default::default()
        }
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Whether a task that failed with `err` on `attempt` should run again.
    pub fn should_retry(&self, err: &Error, attempt: u32) -> bool {
        err.is_recoverable() && self.can_retry(attempt)
    }

    /// Delay before starting attempt number `attempt`; the first attempt starts immediately.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let delay = Duration::from_secs_f64(
            self.initial_delay.as_secs_f64() * self.exponential_base.powf(attempt as f64 - 2.0),
        );
        delay.min(self.max_delay)
    }
}
