//! Retry policy for failed sends
//!
//! Exponential backoff: the n-th failed attempt waits
//! `base_delay * 2^(n-1)` before the next one, until `max_attempts`
//! attempts have been made in total.

use mailcast_common::config::RetryConfig;
use std::time::Duration;

use super::mailer::SendError;

/// Retry policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per job, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once `delay` has elapsed
    Retry { delay: Duration },
    /// Stop; the job is exhausted
    GiveUp { reason: String },
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
        }
    }

    /// Backoff after the given 1-based failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1 << exponent)
    }

    pub fn decide(&self, attempt: u32, error: &SendError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("permanent failure: {}", error),
            };
        }

        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded: {}", self.max_attempts, error),
            };
        }

        RetryDecision::Retry {
            delay: self.delay_for(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn transient() -> SendError {
        SendError::Transport("connection reset".to_string())
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
    }

    #[test]
    fn test_gives_up_on_third_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1, &transient()),
            RetryDecision::Retry {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            policy.decide(2, &transient()),
            RetryDecision::Retry {
                delay: Duration::from_secs(10)
            }
        );
        assert!(matches!(
            policy.decide(3, &transient()),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn test_permanent_errors_give_up_immediately() {
        let policy = RetryPolicy::default();
        let rejected = SendError::Rejected {
            status: 400,
            message: "invalid recipient".to_string(),
        };
        match policy.decide(1, &rejected) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("permanent")),
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            base_delay_ms: 250,
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_for(3), Duration::from_millis(1000));
    }
}
