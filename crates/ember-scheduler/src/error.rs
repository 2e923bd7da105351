use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A live job already uses this id.
    #[error("Job already registered: {id}")]
    DuplicateId { id: String },

    /// No live job with the given id.
    #[error("Job not found: {id}")]
    NotFound { id: String },

    /// Past instant, malformed duration, unresolved placeholder or a
    /// trigger that does not fit the operation.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The job's own computation failed; captured on the job.
    #[error("Job failed: {0}")]
    PayloadFailure(JobFailure),

    /// The job was cancelled before it ran.
    #[error("Job cancelled: {id}")]
    Cancelled { id: String },

    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The manager no longer accepts submissions.
    #[error("Job manager is shut down")]
    ShutDown,

    /// The worker runtime could not be built.
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

impl SchedulerError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::DuplicateId { .. } => "DUPLICATE_ID",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            SchedulerError::PayloadFailure(_) => "PAYLOAD_FAILURE",
            SchedulerError::Cancelled { .. } => "CANCELLED",
            SchedulerError::Timeout { .. } => "TIMEOUT",
            SchedulerError::ShutDown => "SHUT_DOWN",
            SchedulerError::Runtime(_) => "RUNTIME_ERROR",
        }
    }
}

/// Why a payload did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum JobFailure {
    /// The payload returned an error.
    #[error("{0}")]
    Error(Arc<anyhow::Error>),

    /// The payload panicked; the message is the panic payload when it was a string.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for JobFailure {
    fn from(e: anyhow::Error) -> Self {
        JobFailure::Error(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
