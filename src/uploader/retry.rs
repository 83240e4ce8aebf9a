use std::time::Duration;

use crate::config::UploaderConfig;

/// Fixed-delay retry rule for a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &UploaderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.retry_delay(),
        }
    }

    /// `attempts` counts every attempt made so far, including the one that just
    /// failed, so a file gets `max_retries + 1` attempts in total.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_boundary() {
        let policy = RetryPolicy {
            max_retries: 2,
            delay: Duration::from_millis(10),
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.total_attempts(), 3);
    }

    #[test]
    fn test_no_retries() {
        let policy = RetryPolicy {
            max_retries: 0,
            delay: Duration::ZERO,
        };
        assert!(!policy.should_retry(1));
        assert_eq!(policy.total_attempts(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = UploaderConfig {
            max_retries: 5,
            retry_delay_ms: 250,
            ..UploaderConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay, Duration::from_millis(250));
    }
}
