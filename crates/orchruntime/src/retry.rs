use orchcore::{NodeError, RetryOn, RetryPolicy};
use std::time::Duration;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Whether `err` qualifies for another attempt under `policy`, ignoring the budget.
pub fn is_retryable(policy: &RetryPolicy, err: &NodeError) -> bool {
    match err {
        // Retrying cannot change upstream state or a cancelled run.
        NodeError::Reference(_) | NodeError::Aggregation(_) | NodeError::Cancelled => false,
        NodeError::Panicked(_) => matches!(policy.retry_on, RetryOn::Always),
        NodeError::Timeout { .. } => !matches!(policy.retry_on, RetryOn::Never),
        NodeError::Dispatch(e) => match &policy.retry_on {
            RetryOn::Retryable => e.retryable,
            RetryOn::Always => true,
            RetryOn::Never => false,
            RetryOn::Codes { codes } => e.code.as_ref().is_some_and(|c| codes.contains(c)),
        },
    }
}

/// Decide after `attempts` attempts have been made and the last one failed with `err`.
pub fn decide(policy: &RetryPolicy, attempts: u32, err: &NodeError) -> RetryDecision {
    if attempts >= policy.max_attempts || !is_retryable(policy, err) {
        return RetryDecision::GiveUp;
    }
    RetryDecision::RetryAfter(policy.delay_after(attempts))
}
