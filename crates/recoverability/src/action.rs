//! Recoverability decisions and the failure context they are made from.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};

use conveyor_common::IncomingMessage;

/// What the host should do with a message whose processing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverabilityAction {
    /// Process the message again right away, in the same worker.
    ImmediateRetry,
    /// Hand the message back to the transport for redelivery after `delay`.
    DelayedRetry { delay: Duration },
    /// Give up and move the message to `error_queue`.
    MoveToError { error_queue: String },
}

impl RecoverabilityAction {
    #[must_use]
    pub fn immediate_retry() -> Self {
        Self::ImmediateRetry
    }

    #[must_use]
    pub fn delayed_retry(delay: Duration) -> Self {
        Self::DelayedRetry { delay }
    }

    #[must_use]
    pub fn move_to_error(error_queue: impl Into<String>) -> Self {
        Self::MoveToError {
            error_queue: error_queue.into(),
        }
    }

    /// Terminal actions end failure tracking for the message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MoveToError { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImmediateRetry => "immediate_retry",
            Self::DelayedRetry { .. } => "delayed_retry",
            Self::MoveToError { .. } => "move_to_error",
        }
    }
}

impl fmt::Display for RecoverabilityAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImmediateRetry => f.write_str("immediate retry"),
            Self::DelayedRetry { delay } => write!(f, "delayed retry in {}ms", delay.as_millis()),
            Self::MoveToError { error_queue } => write!(f, "move to error queue `{error_queue}`"),
        }
    }
}

/// Bookkeeping kept per message identity between failures.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    /// Failed processing attempts so far, including the current one.
    pub attempts: u32,
    /// Display form of every captured error, oldest first.
    pub errors: Vec<String>,
    pub first_failure: DateTime<Utc>,
    pub last_failure: DateTime<Utc>,
}

impl FailureRecord {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            attempts: 0,
            errors: Vec::new(),
            first_failure: now,
            last_failure: now,
        }
    }
}

/// Everything a policy sees about one failure.
pub struct ErrorContext<'a> {
    pub message: &'a IncomingMessage,
    pub error: &'a anyhow::Error,
    /// Attempt number of this failure, starting at 1.
    pub attempt: u32,
    /// Delayed retries already performed, read from the message headers.
    pub delayed_retries: u32,
}

impl ErrorContext<'_> {
    pub fn message_id(&self) -> &str {
        self.message.message_id.as_str()
    }
}
