//! Structured error taxonomy.
//!
//! `CoreError` gives callers a pattern-matchable type instead of a bare
//! `anyhow::Error`; store and dispatcher implementations still return
//! `anyhow::Result` at their boundary (ergonomic for `?`), wrapping a
//! `CoreError` so it can be recovered with `anyhow::Error::downcast_ref`.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Which broad category an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed ingest payload, unknown job type. Reported synchronously;
    /// nothing is persisted.
    Validation,
    /// Connection pool wait-queue full, or soft ceiling exceeded.
    /// Fail-fast with a retryable signal.
    ResourceExhaustion,
    /// A handler returned an error with no attempts remaining.
    HandlerFailure,
    /// Lease expired before the handler finished; treated like
    /// `HandlerFailure` but tagged distinctly for observability.
    Stall,
    /// Non-2xx, connection error, or timeout delivering a webhook.
    WebhookTransport,
    /// Anything else (store corruption, unexpected state).
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::ResourceExhaustion => "resource_exhaustion",
            ErrorCategory::HandlerFailure => "handler_failure",
            ErrorCategory::Stall => "stall",
            ErrorCategory::WebhookTransport => "webhook_transport",
            ErrorCategory::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Errors that can categorize themselves for retry/reporting decisions.
pub trait Categorizable: std::error::Error {
    fn category(&self) -> ErrorCategory;

    /// Whether the operation that raised this error should be retried by
    /// its caller (distinct from whether the *job* gets another attempt,
    /// which is the retry policy's job).
    fn retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::ResourceExhaustion | ErrorCategory::WebhookTransport
        )
    }
}

/// Structured error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("job stalled (lease expired): {0}")]
    Stalled(String),

    #[error("webhook delivery failed: {0}")]
    WebhookTransport(String),

    #[error("store error: {0}")]
    Store(String),
}

impl Categorizable for CoreError {
    fn category(&self) -> ErrorCategory {
        match self {
            CoreError::Validation(_) => ErrorCategory::Validation,
            CoreError::ResourceExhausted(_) => ErrorCategory::ResourceExhaustion,
            CoreError::NotFound(_) => ErrorCategory::Validation,
            CoreError::HandlerFailed(_) => ErrorCategory::HandlerFailure,
            CoreError::Stalled(_) => ErrorCategory::Stall,
            CoreError::WebhookTransport(_) => ErrorCategory::WebhookTransport,
            CoreError::Store(_) => ErrorCategory::Internal,
        }
    }
}

/// Classification of a job-handler failure, used by the retry policy to
/// decide retry vs. immediate dead-letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient; the job should be retried if attempts remain.
    Retryable,
    /// Permanent; the job should move to dead-letter immediately.
    NonRetryable,
}

/// Error returned by a [`crate::handler::JobHandler`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub kind: FailureKind,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Retryable,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::NonRetryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhausted_is_retryable() {
        let err = CoreError::ResourceExhausted("pool wait queue full".into());
        assert!(err.retryable());
        assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = CoreError::Validation("unknown job type".into());
        assert!(!err.retryable());
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn handler_error_constructors_set_kind() {
        let e = HandlerError::retryable("timeout");
        assert_eq!(e.kind, FailureKind::Retryable);
        let e = HandlerError::non_retryable("bad input");
        assert_eq!(e.kind, FailureKind::NonRetryable);
    }

    #[test]
    fn core_error_downcasts_from_anyhow() {
        let err: anyhow::Error = CoreError::Stalled("lease expired".into()).into();
        let downcast = err.downcast_ref::<CoreError>();
        assert!(matches!(downcast, Some(CoreError::Stalled(_))));
    }

    #[test]
    fn category_display_is_snake_case() {
        assert_eq!(ErrorCategory::WebhookTransport.to_string(), "webhook_transport");
        assert_eq!(ErrorCategory::ResourceExhaustion.to_string(), "resource_exhaustion");
    }
}
