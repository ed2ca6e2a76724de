//! Error types for folio-jobs operations.
//!
//! Defines error types for the major subsystems:
//! - Backing store access (Redis or in-memory)
//! - Queue Manager operations
//! - Task handler execution

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`QueueBackend`](crate::queue::QueueBackend).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    /// The endpoint accepted the connection but refuses writes (replica after failover).
    #[error("Store is read-only: {0}")]
    ReadOnly(String),

    #[error("Store command failed: {0}")]
    Command(String),
}

impl StoreError {
    /// Returns whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_) | StoreError::Timeout(_) | StoreError::ReadOnly(_)
        )
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::ReadOnly || err.code() == Some("READONLY") {
            StoreError::ReadOnly(err.to_string())
        } else if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error()
        {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Connecting gave up after the configured number of attempts.
    #[error("Could not connect to queue store after {attempts} attempts: {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },

    /// The store answers pings but rejects writes.
    #[error("Queue store at {0} is a read-only replica")]
    ReadOnlyReplica(String),

    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid queue configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A dequeued item could not be parsed as a task envelope. It has been dropped.
    #[error("Malformed envelope dropped from '{queue}': {reason}")]
    MalformedEnvelope { queue: String, reason: String },

    #[error("Queue '{queue}' is full ({limit} pending tasks)")]
    QueueFull { queue: String, limit: usize },

    #[error("Task {0} not found in dead-letter store")]
    DeadLetterNotFound(String),

    #[error("Gave up waiting for job {job_id} after {waited:?}")]
    WaitTimeout { job_id: String, waited: Duration },
}

impl QueueError {
    /// Returns whether the underlying failure was a transient store error.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Store(e) if e.is_transient())
    }
}

/// Failure reported by a task handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable failure reason, surfaced in the Status Record.
    pub message: String,
    /// When false the task skips remaining retries and is dead-lettered.
    pub retryable: bool,
}

impl HandlerError {
    /// A failure that may succeed on a later attempt.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will never succeed for this payload.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}
