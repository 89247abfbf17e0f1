use std::time::Duration;

use thiserror::Error;

use crate::domain::{ErrorKind, Frequency};

/// Bounded queue errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// End of stream: the queue was closed and nothing is left to drain.
    #[error("queue is closed")]
    Closed,

    #[error("queue operation cancelled")]
    Cancelled,

    #[error("invalid task: {0}")]
    InvalidTask(String),
}

/// Idempotency store errors. Any of these means "cannot safely proceed".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),

    #[error("idempotency store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by external collaborators (directory, weather, notifier, broker).
#[derive(Debug, Error)]
pub enum PortError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),

    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid {frequency} schedule '{expression}': {reason}")]
    InvalidSchedule {
        frequency: Frequency,
        expression: String,
        reason: String,
    },

    #[error("trigger already started")]
    AlreadyStarted,
}

/// Top-level error for one unit of pipeline work.
#[derive(Debug, Error)]
pub enum SquallError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl SquallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SquallError::Queue(QueueError::Closed | QueueError::Cancelled) => ErrorKind::Shutdown,
            SquallError::Queue(QueueError::InvalidTask(_)) => ErrorKind::Malformed,
            SquallError::Store(_) => ErrorKind::Unavailable,
            SquallError::Port(PortError::Cancelled) => ErrorKind::Shutdown,
            SquallError::Port(_) => ErrorKind::Transient,
            SquallError::Trigger(_) => ErrorKind::Malformed,
            SquallError::Malformed(_) => ErrorKind::Malformed,
            SquallError::CircuitOpen => ErrorKind::CircuitOpen,
            SquallError::Timeout(_) => ErrorKind::Transient,
        }
    }
}
