//! Error taxonomy for the consensus engine.
//!
//! `ClassifiedError` is what the [`crate::retry::RetryController`] reasons about;
//! `CoreError` is what crosses the [`crate::coordinator::Coordinator`] boundary.
//! Kept as two enums (rather than one) because retryability and caller-visibility
//! are orthogonal axes — a `ClassifiedError::Network` either resolves into a
//! successful attempt or, on exhaustion, folds into `CoreError::InsufficientExperts`
//! for the owning expert; it never itself crosses the boundary.

use std::time::Duration;
use thiserror::Error;

/// Error taxonomy used by the retry controller to decide retry eligibility.
#[derive(Debug, Clone, Error)]
pub enum ClassifiedError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited{}", retry_after_suffix(.retry_after))]
    RateLimit { retry_after: Option<Duration> },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("permanent client error ({status}): {message}")]
    PermanentClient4xx { status: u16, message: String },
    #[error("transient server error ({status}): {message}")]
    TransientServer5xx { status: u16, message: String },
    #[error("unclassified error: {0}")]
    Unknown(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry-after {:?})", d),
        None => String::new(),
    }
}

impl ClassifiedError {
    /// Whether the RetryController should schedule another attempt for this kind.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClassifiedError::Network(_)
                | ClassifiedError::Timeout(_)
                | ClassifiedError::TransientServer5xx { .. }
                | ClassifiedError::RateLimit { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClassifiedError::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ClassifiedError::Network(_) => "network",
            ClassifiedError::Timeout(_) => "timeout",
            ClassifiedError::RateLimit { .. } => "rate_limit",
            ClassifiedError::Auth(_) => "auth",
            ClassifiedError::PermanentClient4xx { .. } => "permanent_client_4xx",
            ClassifiedError::TransientServer5xx { .. } => "transient_server_5xx",
            ClassifiedError::Unknown(_) => "unknown",
        }
    }
}

/// A single classified attempt, retained for `RetryExhausted` and for `RetryStats`.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: ClassifiedError,
    pub delay_before_next: Option<Duration>,
}

/// Raised by the RetryController when all retries are spent without a success.
#[derive(Debug, Error)]
#[error("retries exhausted after {} attempts, last error: {}", .history.len(), .history.last().map(|a| a.error.to_string()).unwrap_or_default())]
pub struct RetryExhausted {
    pub history: Vec<RetryAttempt>,
}

/// Boundary errors the Coordinator can return to a caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("insufficient experts: only {succeeded} of {attempted} produced usable output")]
    InsufficientExperts { attempted: usize, succeeded: usize },

    #[error("unknown expert id: {0}")]
    UnknownExpert(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("deadline exceeded after {elapsed:?} (limit {limit:?})")]
    DeadlineExceeded { elapsed: Duration, limit: Duration },

    #[error("internal error in {component}: {detail}")]
    InternalError { component: String, detail: String },

    #[error("question must not be empty")]
    EmptyQuestion,
}
