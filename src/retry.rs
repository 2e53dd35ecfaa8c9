//! Decides whether a failed job is rescheduled or abandoned.

use std::time::Duration;

/// Classification of a failed execution attempt, as seen by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The handler reported an error that may resolve on its own.
    Transient,
    /// The handler signalled that no retry can succeed.
    Permanent,
    /// The handler exceeded the per-job timeout. Treated like a transient
    /// failure.
    Timeout,
}

/// What to do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule the job after the given delay.
    RetryAfter(Duration),
    /// Move the job to the dead-letter table.
    Abandon,
}

/// Exponential backoff with a cap, plus a hard attempt limit.
///
/// The delay before the next attempt doubles with every failure, starting at
/// `base_delay` and never exceeding `max_delay`. Once `max_attempts`
/// executions have failed the job is abandoned regardless of error kind, and
/// a permanent failure is abandoned without any retry at all.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Executions allowed before the job is abandoned.
    pub max_attempts: u32,
    /// Delay applied after the first failure.
    pub base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(10 * 60),
        }
    }
}

impl RetryPolicy {
    /// Pure decision function of (attempt count, error kind, configuration).
    ///
    /// `attempts` is the number of executions started so far, including the
    /// one that just failed.
    pub fn decide(&self, attempts: u32, kind: FailureKind) -> RetryDecision {
        if kind == FailureKind::Permanent || attempts >= self.max_attempts {
            return RetryDecision::Abandon;
        }

        // 2^exp with the exponent clamped; max_delay caps the result anyway.
        let exp = attempts.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        RetryDecision::RetryAfter(delay.min(self.max_delay))
    }
}
