//! Retry and backoff decisions for failed task attempts.
//!
//! Stateless: all logic lives in associated functions that take the task's
//! `RetryPolicy` and the attempt's retry count. The engine performs the
//! actual rescheduling with the delay computed here.

use std::time::Duration;

use taskloom_types::run::FailureKind;
use taskloom_types::workflow::{BackoffPolicy, RetryPolicy};

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`.
    Retry { delay: Duration },
    /// Surface the failure as terminal.
    GiveUp,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should be scheduled.
    ///
    /// `retry_count` is 0 on the first attempt. Non-retryable kinds
    /// (explicit terminal failures, validation, cancellation, timeouts)
    /// bypass the policy entirely.
    pub fn should_retry(policy: &RetryPolicy, retry_count: u32, kind: FailureKind) -> bool {
        kind.is_retryable() && retry_count < policy.max_retries
    }

    /// Delay before retry number `retry_index` (0-based):
    /// `min(base * factor^i, max_seconds)`. Zero without a backoff policy.
    pub fn backoff_delay(policy: &RetryPolicy, retry_index: u32) -> Duration {
        match &policy.backoff {
            Some(backoff) => Self::delay_for(backoff, retry_index),
            None => Duration::ZERO,
        }
    }

    /// Delays for every retry the policy allows, in order.
    pub fn backoff_schedule(policy: &RetryPolicy) -> Vec<Duration> {
        (0..policy.max_retries)
            .map(|i| Self::backoff_delay(policy, i))
            .collect()
    }

    /// Combine `should_retry` and `backoff_delay`.
    pub fn decide(policy: &RetryPolicy, retry_count: u32, kind: FailureKind) -> RetryDecision {
        if Self::should_retry(policy, retry_count, kind) {
            RetryDecision::Retry {
                delay: Self::backoff_delay(policy, retry_count),
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    fn delay_for(backoff: &BackoffPolicy, retry_index: u32) -> Duration {
        let cap = backoff.max_seconds as f64;
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let raw = backoff.base_seconds * backoff.factor.powi(exponent);
        // powi overflows to inf for large indices; the cap still applies.
        let secs = if raw.is_finite() { raw.min(cap) } else { cap };
        // `u64::MAX as f64` rounds past `Duration::MAX`.
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
