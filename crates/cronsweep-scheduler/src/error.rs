use thiserror::Error;

use crate::types::JobId;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    /// The execution unit for a job could not be started.
    #[error("Failed to spawn job {job_id}: {reason}")]
    Spawn { job_id: JobId, reason: String },

    /// Underlying I/O failure (marker file, pipes, child wait).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The instance lock marker could not be read or written.
    #[error("Instance lock error: {0}")]
    Lock(String),

    /// One or more jobs could not be finalized after expiry. Sibling jobs
    /// were still processed; each entry is `(job_id, reason)`.
    #[error("{} job(s) failed to finalize: {}", .failures.len(), describe(.failures))]
    Finalize { failures: Vec<(JobId, String)> },
}

fn describe(failures: &[(JobId, String)]) -> String {
    failures
        .iter()
        .map(|(id, reason)| format!("job {id}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
