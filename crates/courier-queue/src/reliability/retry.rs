//! Retry bound for tasks that keep failing with retryable errors

use serde::{Deserialize, Serialize};

/// How many claims a task gets before a retryable failure becomes terminal
///
/// A task whose attempt count has reached `max_attempts` is not returned to
/// `FAILURE` on its next retryable error; it goes `FATAL` with a diagnostic,
/// which makes the error log double as the dead-letter record.
///
/// # Example
///
/// ```
/// use courier_queue::RetryPolicy;
///
/// let policy = RetryPolicy::new(3);
/// assert!(policy.has_attempts_remaining(2));
/// assert!(!policy.has_attempts_remaining(3));
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    /// Create a policy allowing `max_attempts` claims (at least one)
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Check if there are remaining attempts after `current_attempt` (1-based)
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bound() {
        assert_eq!(RetryPolicy::default().max_attempts, 5);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_zero_is_clamped() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::default().with_max_attempts(3);

        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
        assert!(!policy.has_attempts_remaining(4));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::new(10);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
