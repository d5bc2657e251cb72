//! Error types for reposcan.

use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

/// Result type alias using reposcan's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for reposcan operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Queue job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// A job was asked to move backwards or sideways in its lifecycle
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// Enqueue rejected because the pending backlog is at its ceiling
    #[error("Queue full: {depth} pending jobs (limit {limit})")]
    QueueFull { depth: i64, limit: i64 },

    /// Vector length differs from the dimension registered for the model
    #[error("Dimension mismatch for model {model}: expected {expected}, got {actual}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },

    /// Embedding generation or response handling failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Inference engine could not be reached or refused the batch
    #[error("Inference unavailable: {0}")]
    InferenceUnavailable(String),

    /// Inference engine did not answer in time
    #[error("Inference timeout: {0}")]
    InferenceTimeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the inference engine failed for a whole batch.
    pub fn is_inference_failure(&self) -> bool {
        matches!(
            self,
            Error::InferenceUnavailable(_) | Error::InferenceTimeout(_)
        )
    }
}
