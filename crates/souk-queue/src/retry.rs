//! Retry decisions for failed attempts

use std::time::Duration;

use crate::job::BackoffStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Dispatch again no earlier than `delay` from now
    Retry { delay: Duration },
    /// Attempt budget spent; the failure is terminal
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffStrategy) -> Self {
        Self { backoff }
    }

    /// `attempts` counts the attempt that just failed
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        if attempts < max_attempts {
            RetryDecision::Retry {
                delay: self.backoff.delay(attempts),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(BackoffStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_until_budget_spent() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1, 3),
            RetryDecision::Retry {
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            policy.decide(2, 3),
            RetryDecision::Retry {
                delay: Duration::from_millis(2000)
            }
        );
        assert_eq!(policy.decide(3, 3), RetryDecision::Exhausted);
        assert_eq!(policy.decide(4, 3), RetryDecision::Exhausted);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let policy = RetryPolicy::new(BackoffStrategy::Constant { ms: 0 });
        assert_eq!(policy.decide(1, 1), RetryDecision::Exhausted);
    }
}
