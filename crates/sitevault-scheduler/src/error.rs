use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur within the backup orchestration core.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Malformed schedule or registry input. Rejected before anything is stored.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The job is not in a state that accepts this event.
    #[error("Invalid transition: job {job_id} is {from}, cannot apply {event}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        event: &'static str,
    },

    /// An incremental plan named a parent that is not a completed job of the
    /// same (site, sink) pair.
    #[error("Invalid parent {parent_id}: {reason}")]
    InvalidParent { parent_id: String, reason: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    #[error("Site not found: {id}")]
    SiteNotFound { id: String },

    #[error("Sink not found: {id}")]
    SinkNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::InvalidParent { .. } => "INVALID_PARENT",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::ScheduleNotFound { .. } => "SCHEDULE_NOT_FOUND",
            SchedulerError::SiteNotFound { .. } => "SITE_NOT_FOUND",
            SchedulerError::SinkNotFound { .. } => "SINK_NOT_FOUND",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::JobNotFound { .. }
                | SchedulerError::ScheduleNotFound { .. }
                | SchedulerError::SiteNotFound { .. }
                | SchedulerError::SinkNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
