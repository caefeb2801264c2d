//! Error types for job execution and pool management.

use chrono::{DateTime, Utc};
use queue_core::{JobParseError, ParseError, StoreError, ValidationError};
use thiserror::Error;

/// Why a single job attempt did not succeed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid queue record: {0}")]
    Validation(#[from] ValidationError),

    #[error("job {id} is already reserved (since {reserved_at})")]
    AlreadyReserved {
        id: String,
        reserved_at: DateTime<Utc>,
    },

    #[error("failed to reserve job: {0}")]
    Reservation(#[source] StoreError),

    #[error("failed to parse job: {0}")]
    Parse(#[from] ParseError),

    #[error("no handler registered for job type: {0}")]
    HandlerNotFound(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("failed to delete completed job: {0}")]
    Completion(#[source] StoreError),

    #[error("failed to record job failure ({cause}): {source}")]
    FailurePersistence {
        cause: String,
        #[source]
        source: StoreError,
    },

    #[error("timed out waiting to enqueue job")]
    EnqueueTimeout,

    #[error("timed out waiting for job result")]
    ResultTimeout,

    #[error("worker pool is shut down")]
    PoolClosed,
}

impl JobError {
    /// Whether this error went through the failure path, leaving the record
    /// in the store with its attempt counter bumped.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Parse(_)
                | JobError::HandlerNotFound(_)
                | JobError::Handler(_)
                | JobError::HandlerPanicked(_)
        )
    }
}

impl From<JobParseError> for JobError {
    fn from(err: JobParseError) -> Self {
        match err {
            JobParseError::Validation(e) => JobError::Validation(e),
            JobParseError::Parse(e) => JobError::Parse(e),
        }
    }
}

/// Errors from the handler registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler already registered for job type: {0}")]
    Duplicate(String),

    #[error("no handler registered for job type: {0}")]
    NotFound(String),

    #[error("handler job type must not be empty")]
    EmptyType,
}

/// Errors from shutting a pool down.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown deadline exceeded with {busy} job(s) still running")]
    DeadlineExceeded { busy: usize },
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Errors from the processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("processor is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_path_errors_are_retryable() {
        assert!(JobError::Handler("boom".into()).is_retryable());
        assert!(JobError::HandlerPanicked("boom".into()).is_retryable());
        assert!(JobError::HandlerNotFound("email".into()).is_retryable());
        assert!(JobError::Parse(ParseError::MissingType).is_retryable());

        assert!(!JobError::Validation(ValidationError::MissingId).is_retryable());
        assert!(!JobError::ResultTimeout.is_retryable());
        assert!(!JobError::Completion(StoreError::NotFound("x".into())).is_retryable());
    }

    #[test]
    fn panic_message_is_visible() {
        let err = JobError::HandlerPanicked("index out of bounds".into());
        assert_eq!(err.to_string(), "handler panicked: index out of bounds");
    }
}
