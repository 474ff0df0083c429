//! Defines basic error and result types used throughout the application.

use std::{error::Error, fmt};

use redis::RedisError;

/// Result type used throughout the application.
pub type QueueResult<T> = Result<T, QueueError>;

/// Error type used throughout the application.
#[derive(Debug)]
pub enum QueueError {
    /// Job submission was rejected before anything was written, e.g. unknown job type or missing
    /// payload field.
    Validation(String),

    /// Error occurred during interaction with Redis.
    Redis(RedisError),

    /// No usable connection to Redis, e.g. while a reconnect is in progress.
    RedisConnection(String),

    /// Backing store failed for a reason other than Redis itself.
    Store(String),

    /// Job or payload could not be (de)serialised.
    Serialization(String),

    /// Request was not valid due to current state of some resource(s).
    Conflict(String),

    /// Operation attempted on job that does not exist.
    NoSuchJob(String),

    /// Operation attempted on a queue, store or listener that has been closed.
    Closed(String),

    /// One or more shutdown steps failed. Every step was still attempted.
    Shutdown(Vec<String>),
}

impl QueueError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        QueueError::Validation(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        QueueError::Conflict(msg.into())
    }

    pub fn closed<S: Into<String>>(msg: S) -> Self {
        QueueError::Closed(msg.into())
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        QueueError::Store(msg.into())
    }

    /// True if the request was rejected before reaching the store.
    pub fn is_validation(&self) -> bool {
        matches!(self, QueueError::Validation(_))
    }

    /// True if the failure came from the backing store or the connection to it.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            QueueError::Redis(_)
                | QueueError::RedisConnection(_)
                | QueueError::Store(_)
                | QueueError::Serialization(_)
        )
    }
}

impl From<RedisError> for QueueError {
    fn from(err: RedisError) -> Self {
        QueueError::Redis(err)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueError::Redis(err) => err.fmt(f),
            QueueError::RedisConnection(msg) => write!(f, "Failed to connect to Redis: {}", msg),
            QueueError::NoSuchJob(job_id) => write!(f, "Job with ID {} does not exist", job_id),
            QueueError::Shutdown(failures) => {
                write!(f, "Shutdown incomplete: {}", failures.join("; "))
            }
            QueueError::Validation(msg)
            | QueueError::Store(msg)
            | QueueError::Serialization(msg)
            | QueueError::Conflict(msg)
            | QueueError::Closed(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for QueueError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            QueueError::Redis(err) => Some(err),
            _ => None,
        }
    }
}
