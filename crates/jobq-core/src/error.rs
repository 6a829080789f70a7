//! Error types for jobq.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

/// Result type alias using jobq's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for jobq operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Invalid input (rejected before anything is persisted)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Cancellation requested for a job that is processing or already terminal
    #[error("Cannot cancel job {id}: status is {status}")]
    CannotCancel { id: Uuid, status: JobStatus },

    /// State transition requested from the wrong state
    #[error("Invalid transition for job {id}: expected {expected}, found {actual}")]
    InvalidTransition {
        id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    /// Transition attempted by a worker that no longer holds the job
    #[error("Job {id} is not held by {worker_id} (holder: {})", holder.as_deref().unwrap_or("none"))]
    NotHolder {
        id: Uuid,
        worker_id: String,
        holder: Option<String>,
    },

    /// Processors did not exit within the shutdown timeout
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Pool was started twice
    #[error("Worker pool already started")]
    AlreadyStarted,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Error::Migration(e.to_string())
    }
}

impl Error {
    /// Whether this error came from the backing store rather than the caller.
    ///
    /// The worker pool treats these as "nothing claimed this tick".
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Internal(_))
    }
}
