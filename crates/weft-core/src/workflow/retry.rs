//! Per-step retry policy evaluation with exponential backoff.

use std::time::Duration;

use weft_types::workflow::RetryPolicy;

/// Evaluates a `RetryPolicy` for a step.
#[derive(Debug, Clone)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Whether another attempt is allowed after `retry_count` retries.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.policy.max_retries
    }

    /// Backoff delay before retry number `retry_count` (0-based).
    ///
    /// delay = retry_delay_ms * retry_backoff_multiplier ^ retry_count
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let base = self.policy.retry_delay_ms as f64;
        let factor = self.policy.retry_backoff_multiplier.powi(retry_count as i32);
        Duration::from_millis((base * factor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, delay_ms: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay_ms: delay_ms,
            retry_backoff_multiplier: multiplier,
        }
    }

    #[test]
    fn test_should_retry_up_to_max() {
        let handler = RetryHandler::new(policy(3, 1000, 2.0));
        assert!(handler.should_retry(0));
        assert!(handler.should_retry(2));
        assert!(!handler.should_retry(3));
        assert!(!handler.should_retry(4));
    }

    #[test]
    fn test_zero_max_retries_never_retries() {
        let handler = RetryHandler::new(policy(0, 1000, 2.0));
        assert!(!handler.should_retry(0));
    }

    #[test]
    fn test_exponential_backoff() {
        let handler = RetryHandler::new(policy(3, 1000, 2.0));
        assert_eq!(handler.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(handler.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(handler.backoff_delay(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_multiplier_one_is_constant_delay() {
        let handler = RetryHandler::new(policy(5, 250, 1.0));
        assert_eq!(handler.backoff_delay(0), Duration::from_millis(250));
        assert_eq!(handler.backoff_delay(4), Duration::from_millis(250));
    }

    #[test]
    fn test_default_policy() {
        let handler = RetryHandler::new(RetryPolicy::default());
        assert!(handler.should_retry(2));
        assert!(!handler.should_retry(3));
        assert_eq!(handler.backoff_delay(1), Duration::from_millis(2000));
    }
}
