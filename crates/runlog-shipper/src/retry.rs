//! Backoff policy for retrying failed batch writes.
//!
//! Retries happen inline within one flush pass: the writer sleeps for the
//! computed delay and tries the same batch again. Failed batches are never
//! put back on a queue.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::sink::SinkError;

/// How retry delays grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay increases by base amount each attempt.
    Linear,
}

/// Delay settings for batch write retries, without the attempt limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,
    /// Strategy for calculating backoff delays.
    pub strategy: BackoffStrategy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl BackoffConfig {
    /// Policy allowing `max_attempts` attempts with these delays.
    pub fn to_policy(&self, max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter_factor: self.jitter_factor,
            strategy: self.strategy,
        }
    }
}

/// Retry policy for a batch write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffConfig::default().to_policy(3)
    }
}

/// Decision context for a failed write attempt.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Error returned by the sink.
    pub error: &'a SinkError,
    /// Policy to apply.
    pub policy: &'a BackoffPolicy,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then try again.
    Retry {
        /// How long to wait before the next attempt
        delay: Duration,
    },
    /// Stop retrying.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl<'a> RetryContext<'a> {
    /// Creates a retry context for a failed attempt.
    pub fn new(attempt_number: u32, error: &'a SinkError, policy: &'a BackoffPolicy) -> Self {
        Self { attempt_number, error, policy }
    }

    /// Decides whether and when to try again.
    ///
    /// Gives up on non-retryable errors and once `max_attempts` is reached.
    /// A `Retry-After` hint from the sink replaces the computed delay, still
    /// capped by `max_delay`.
    pub fn decide_retry(&self) -> RetryDecision {
        let max_attempts = self.policy.max_attempts.max(1);
        if self.attempt_number >= max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({max_attempts}) exhausted"),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {}", self.error) };
        }

        RetryDecision::Retry { delay: self.calculate_delay() }
    }

    fn calculate_delay(&self) -> Duration {
        if let Some(retry_after) = self.error.retry_after() {
            return retry_after.min(self.policy.max_delay);
        }

        let base_delay = match self.policy.strategy {
            BackoffStrategy::Fixed => self.policy.base_delay,
            BackoffStrategy::Linear => self.policy.base_delay.saturating_mul(self.attempt_number),
            BackoffStrategy::Exponential => {
                let exponent = self.attempt_number.saturating_sub(1).min(20);
                self.policy.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        let capped_delay = base_delay.min(self.policy.max_delay);
        apply_jitter(capped_delay, self.policy.jitter_factor).min(self.policy.max_delay)
    }
}

/// Randomizes `duration` by ±`jitter_factor` so concurrent workers do not
/// retry in lockstep.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let jitter_range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let jitter_offset = rand::rng().random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_without_jitter() -> BackoffPolicy {
        BackoffPolicy { jitter_factor: 0.0, max_attempts: 10, ..BackoffPolicy::default() }
    }

    fn delay_for(attempt: u32, error: &SinkError, policy: &BackoffPolicy) -> Duration {
        match RetryContext::new(attempt, error, policy).decide_retry() {
            RetryDecision::Retry { delay } => delay,
            RetryDecision::GiveUp { reason } => panic!("unexpected give up: {reason}"),
        }
    }

    #[test]
    fn exponential_delays_double_until_capped() {
        let policy = policy_without_jitter();
        let error = SinkError::server_error(503, "unavailable");

        let delays: Vec<u64> = (1..=6).map(|n| delay_for(n, &error, &policy).as_secs()).collect();

        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let error = SinkError::network("reset");
        let linear = BackoffPolicy { strategy: BackoffStrategy::Linear, ..policy_without_jitter() };
        let fixed = BackoffPolicy { strategy: BackoffStrategy::Fixed, ..policy_without_jitter() };

        assert_eq!(delay_for(3, &error, &linear), Duration::from_secs(6));
        assert_eq!(delay_for(3, &error, &fixed), Duration::from_secs(2));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = BackoffPolicy { max_attempts: 3, ..policy_without_jitter() };
        let error = SinkError::timeout(10);

        assert!(matches!(
            RetryContext::new(2, &error, &policy).decide_retry(),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            RetryContext::new(3, &error, &policy).decide_retry(),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn zero_max_attempts_means_single_attempt() {
        let policy = BackoffPolicy { max_attempts: 0, ..policy_without_jitter() };
        let error = SinkError::timeout(10);

        assert!(matches!(
            RetryContext::new(1, &error, &policy).decide_retry(),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn client_errors_are_not_retried() {
        let policy = policy_without_jitter();
        let error = SinkError::client_error(400, "invalid schema");

        let decision = RetryContext::new(1, &error, &policy).decide_retry();

        assert_eq!(
            decision,
            RetryDecision::GiveUp { reason: "non-retryable error: client error: HTTP 400".into() }
        );
    }

    #[test]
    fn retry_after_hint_is_capped_by_max_delay() {
        let policy = policy_without_jitter();

        assert_eq!(
            delay_for(1, &SinkError::rate_limited(Some(12)), &policy),
            Duration::from_secs(12)
        );
        assert_eq!(
            delay_for(1, &SinkError::rate_limited(Some(600)), &policy),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy { jitter_factor: 0.25, max_attempts: 10, ..BackoffPolicy::default() };
        let error = SinkError::network("reset");

        for _ in 0..100 {
            let delay = delay_for(2, &error, &policy);
            assert!(delay >= Duration::from_secs(3) && delay <= Duration::from_secs(5));
        }
    }
}
