use std::time::Duration;

use shared::{
    domain::{DeliveryStatus, MembershipState},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

/// Coarse classification used by the backoff policy and by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    RateLimited,
    Timeout,
    Unauthorized,
    Forbidden,
    Validation,
    NotFound,
    Throttled,
    InvalidState,
    Exhausted,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("rate limited by server")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out")]
    Timeout,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("throttled: next call allowed in {wait:?}")]
    Throttled { wait: Duration },
    #[error("{operation} requires a joined conversation (state: {state})")]
    InvalidState {
        operation: &'static str,
        state: MembershipState,
    },
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error("message {id} is {status:?}; operation not allowed")]
    InvalidMessageState { id: String, status: DeliveryStatus },
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SyncError> },
    #[error("session closed")]
    SessionClosed,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Timeout => ErrorKind::Timeout,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Throttled { .. } => ErrorKind::Throttled,
            Self::InvalidState { .. }
            | Self::UnknownMessage(_)
            | Self::InvalidMessageState { .. } => ErrorKind::InvalidState,
            Self::RetriesExhausted { .. } => ErrorKind::Exhausted,
            Self::SessionClosed => ErrorKind::Closed,
        }
    }

    /// Only transport-level transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::RateLimited | ErrorKind::Timeout
        )
    }

    /// Delay the server asked for, if this is a rate limit carrying one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::Unauthorized => Self::Unauthorized(value.message),
            ErrorCode::Forbidden => Self::Forbidden(value.message),
            ErrorCode::NotFound => Self::NotFound(value.message),
            ErrorCode::Validation => Self::Validation(value.message),
            ErrorCode::RateLimited => Self::RateLimited {
                retry_after: value.retry_after_ms.map(Duration::from_millis),
            },
            ErrorCode::Timeout => Self::Timeout,
            ErrorCode::Unavailable | ErrorCode::Internal => Self::Network(value.message),
        }
    }
}
