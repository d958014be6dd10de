//! Retry policy and the per-sequence attempt counter
//!
//! One user or schedule gesture starts a *sequence*; each process launch in
//! it is an *attempt*. Every launch after the first is a *retry*, and retry
//! `n` waits `2^n` seconds before it starts. `max_attempts` bounds the
//! number of retries, so with the default of 3 an always-failing transfer
//! launches four times and waits 2 s, 4 s and 8 s in between.
//!
//! The controller only decides. Waiting, launching and cancellation are
//! driven by the session loop, which feeds the decisions back in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt, at least 1
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retry failed attempts automatically
    #[serde(default = "default_auto_retry")]
    pub auto_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            auto_retry: default_auto_retry(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            auto_retry: false,
        }
    }

    /// Backoff before the `retry`-th retry: 2^n seconds
    #[must_use]
    pub fn backoff_duration(retry: u32) -> Duration {
        Duration::from_secs(2u64.saturating_pow(retry))
    }

    /// Reject a zero attempt budget
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SessionError::invalid_config("max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// What to do after an attempt completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt succeeded; the sequence is over
    Succeed,
    /// Cancellation was requested; no further attempts
    Cancel,
    /// Wait `delay`, then run attempt number `attempt`
    Retry {
        /// Number of the upcoming attempt (1-based)
        attempt: u32,
        /// Backoff before it starts
        delay: Duration,
    },
    /// Budget exhausted or retries disabled
    Fail,
}

/// Attempt and retry counters for one session
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    attempt: u32,
    retries: u32,
}

impl RetryController {
    /// Create a controller
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            retries: 0,
        }
    }

    /// Active policy
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Replace the policy; applies from the next decision on
    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    /// Attempts launched in the current sequence
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Retries scheduled in the current sequence
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Reset the counters for a fresh user or schedule initiated start
    pub fn begin_sequence(&mut self) {
        self.attempt = 0;
        self.retries = 0;
    }

    /// Count a new attempt and return its 1-based number
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// Decide the follow-up of the attempt that just completed
    pub fn on_completion(&mut self, success: bool, cancel_requested: bool) -> RetryDecision {
        if success {
            self.attempt = 0;
            self.retries = 0;
            return RetryDecision::Succeed;
        }
        if cancel_requested {
            return RetryDecision::Cancel;
        }
        if !self.policy.auto_retry || self.retries >= self.policy.max_attempts {
            return RetryDecision::Fail;
        }

        self.retries += 1;
        RetryDecision::Retry {
            attempt: self.attempt + 1,
            delay: RetryPolicy::backoff_duration(self.retries),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_auto_retry() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(RetryPolicy::backoff_duration(1), Duration::from_secs(2));
        assert_eq!(RetryPolicy::backoff_duration(2), Duration::from_secs(4));
        assert_eq!(RetryPolicy::backoff_duration(3), Duration::from_secs(8));
        assert_eq!(
            RetryPolicy::backoff_duration(200),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_always_failing_stops_at_budget() {
        let mut controller = RetryController::new(RetryPolicy::default());
        controller.begin_sequence();

        let mut delays = Vec::new();
        let mut attempts;
        loop {
            attempts = controller.begin_attempt();
            match controller.on_completion(false, false) {
                RetryDecision::Retry { attempt, delay } => {
                    assert_eq!(attempt, attempts + 1);
                    delays.push(delay.as_secs());
                }
                RetryDecision::Fail => break,
                other => panic!("unexpected decision {other:?}"),
            }
        }

        assert_eq!(attempts, 4);
        assert_eq!(controller.retries(), 3);
        assert_eq!(delays, vec![2, 4, 8]);
    }

    #[test]
    fn test_single_retry_budget() {
        let mut controller = RetryController::new(RetryPolicy {
            max_attempts: 1,
            auto_retry: true,
        });
        controller.begin_sequence();
        controller.begin_attempt();
        assert_eq!(
            controller.on_completion(false, false),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
        controller.begin_attempt();
        assert_eq!(controller.on_completion(false, false), RetryDecision::Fail);
    }

    #[test]
    fn test_new_sequence_restarts_backoff() {
        let mut controller = RetryController::new(RetryPolicy::default());
        controller.begin_sequence();
        controller.begin_attempt();
        controller.on_completion(false, false);
        controller.begin_attempt();
        controller.on_completion(false, false);
        assert_eq!(controller.retries(), 2);

        controller.begin_sequence();
        assert_eq!(controller.begin_attempt(), 1);
        assert_eq!(
            controller.on_completion(false, false),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn test_success_resets_counter() {
        let mut controller = RetryController::new(RetryPolicy::default());
        controller.begin_attempt();
        assert!(matches!(
            controller.on_completion(false, false),
            RetryDecision::Retry { .. }
        ));
        controller.begin_attempt();
        assert_eq!(controller.on_completion(true, false), RetryDecision::Succeed);
        assert_eq!(controller.attempt(), 0);
        assert_eq!(controller.retries(), 0);
    }

    #[test]
    fn test_cancel_suppresses_retry() {
        let mut controller = RetryController::new(RetryPolicy::default());
        controller.begin_attempt();
        assert_eq!(controller.on_completion(false, true), RetryDecision::Cancel);
    }

    #[test]
    fn test_success_wins_over_cancel() {
        let mut controller = RetryController::new(RetryPolicy::default());
        controller.begin_attempt();
        assert_eq!(controller.on_completion(true, true), RetryDecision::Succeed);
    }

    #[test]
    fn test_auto_retry_disabled() {
        let mut controller = RetryController::new(RetryPolicy {
            max_attempts: 5,
            auto_retry: false,
        });
        controller.begin_attempt();
        assert_eq!(controller.on_completion(false, false), RetryDecision::Fail);
    }

    #[test]
    fn test_policy_change_applies_to_next_decision() {
        let mut controller = RetryController::new(RetryPolicy::default());
        controller.begin_attempt();
        controller.set_policy(RetryPolicy::no_retry());
        assert_eq!(controller.on_completion(false, false), RetryDecision::Fail);
    }

    #[test]
    fn test_validate_and_serde_defaults() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(
            RetryPolicy {
                max_attempts: 0,
                auto_retry: true
            }
            .validate()
            .is_err()
        );

        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, RetryPolicy::default());
    }
}
