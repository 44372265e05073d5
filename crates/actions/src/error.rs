//! Action-level error type.

use thiserror::Error;

/// Errors returned by an action handler or dispatcher.
///
/// The dispatcher uses the variant to decide retry behaviour:
/// - `Retryable`: queued actions are re-tried with exponential back-off.
/// - `Fatal`: the action is abandoned and the failure is reported.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Transient failure; the dispatcher may re-try.
    #[error("retryable action error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal action error: {0}")]
    Fatal(String),

    /// No handler is registered for the action kind.
    #[error("no handler registered for action kind '{0}'")]
    Unhandled(String),

    /// A synchronous action did not finish within the caller's budget.
    #[error("action timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

impl ActionError {
    /// Whether the dispatcher is allowed to re-try after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
