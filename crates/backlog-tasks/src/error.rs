//! Task error taxonomy

use backlog_persist::StorageError;
use backlog_providers::{LimiterError, ProviderError};
use backlog_queue::QueueError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while dispatching or running a task
#[derive(Debug, Error)]
pub enum TaskError {
    /// Input does not match the task's schema; the handler never runs
    #[error("Invalid input: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{task} cannot be triggered by {triggered_by}")]
    Forbidden { task: String, triggered_by: String },

    #[error("Rate limited on {key}, retry after {}ms", .retry_after.as_millis())]
    RateLimited { key: String, retry_after: Duration },

    #[error("Provider error: {0}")]
    Provider(ProviderError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Programmer error or broken invariant
    #[error("{0}")]
    Fatal(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Io(_) | Self::DeadlineExceeded(_) | Self::Queue(_) => {
                true
            }
            Self::Provider(e) => e.is_transient(),
            Self::Storage(e) => !matches!(
                e,
                StorageError::Invalid(_) | StorageError::Serialization(_) | StorageError::NotFound(_)
            ),
            Self::Validation(_)
            | Self::NotFound(_)
            | Self::Forbidden { .. }
            | Self::Fatal(_)
            | Self::Panicked(_) => false,
        }
    }

    /// Backoff the failure itself asks for
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<LimiterError> for TaskError {
    fn from(e: LimiterError) -> Self {
        match e {
            LimiterError::RateLimited {
                key,
                ms_before_next,
            } => Self::RateLimited {
                key,
                retry_after: Duration::from_millis(ms_before_next),
            },
            other => Self::Provider(ProviderError::Limiter(other)),
        }
    }
}

impl From<ProviderError> for TaskError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Limiter(limiter) => limiter.into(),
            other => Self::Provider(other),
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidData => {
                Self::Fatal(e.to_string())
            }
            _ => Self::Io(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!TaskError::validation("bad").is_retryable());
        assert!(!TaskError::NotFound("x".into()).is_retryable());
        assert!(!TaskError::fatal("bug").is_retryable());
        assert!(!TaskError::Panicked("boom".into()).is_retryable());
        assert!(TaskError::Io("reset".into()).is_retryable());
        assert!(TaskError::Storage(StorageError::Connection("gone".into())).is_retryable());
        assert!(!TaskError::Storage(StorageError::Invalid("row".into())).is_retryable());
    }

    #[test]
    fn test_rate_limit_surfaces_retry_after() {
        let err: TaskError = ProviderError::Limiter(LimiterError::RateLimited {
            key: "jikanAPI:global".into(),
            ms_before_next: 750,
        })
        .into();

        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(750)));
    }

    #[test]
    fn test_provider_status_classification() {
        let not_found: TaskError = ProviderError::Status {
            status: 404,
            description: "missing".into(),
        }
        .into();
        assert!(!not_found.is_retryable());

        let unavailable: TaskError = ProviderError::Status {
            status: 503,
            description: "maintenance".into(),
        }
        .into();
        assert!(unavailable.is_retryable());
    }
}
