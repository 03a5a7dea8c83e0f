//! Error types for job management.

use thiserror::Error;

use super::JobId;
use crate::db::DbError;

/// Errors from job bookkeeping (not from the job's own outcome).
#[derive(Debug, Error)]
pub enum JobError {
    /// No job with this id exists.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// The job is still running in this process.
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),

    /// The job finished successfully and has nothing to resume.
    #[error("job {id} is {state} and cannot be resumed")]
    NotResumable {
        /// Job id.
        id: JobId,
        /// Persisted state.
        state: String,
    },

    /// The job was left unfinished by an earlier process.
    #[error("job {id} was interrupted while {state}; resume it to continue")]
    Interrupted {
        /// Job id.
        id: JobId,
        /// Persisted state.
        state: String,
    },

    /// Persisted job state could not be read back.
    #[error("job {id} has corrupt state: {detail}")]
    CorruptState {
        /// Job id.
        id: JobId,
        /// What failed to parse.
        detail: String,
    },

    /// Query failed.
    #[error("job store query failed: {0}")]
    Database(#[from] sqlx::Error),

    /// Store could not be opened.
    #[error(transparent)]
    Store(#[from] DbError),

    /// Manifest or options could not be serialized.
    #[error("failed to serialize job state: {0}")]
    Serialization(#[from] serde_json::Error),
}
