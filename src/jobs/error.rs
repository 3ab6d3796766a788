//! Errors raised by the job engine.
//!
//! Execution failures (model unavailable, transcription errors, timeouts,
//! lost workers) never show up here: they are recorded on the job itself as
//! an `ErrorDetail`. These are the errors a *caller* of the engine sees.

use thiserror::Error;

use crate::jobs::job::{ErrorDetail, JobId, JobState};

/// Failures of the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already exists")]
    Duplicate(JobId),

    /// Transient storage failure; the caller may retry.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("admission queue is full ({max_depth} jobs waiting)")]
    Capacity { max_depth: usize },

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} has no result ({state})")]
    NotReady {
        id: JobId,
        state: JobState,
        error_detail: Option<ErrorDetail>,
    },

    #[error("job {id} is already {state}")]
    AlreadyTerminal { id: JobId, state: JobState },

    #[error("job {id} kept changing underneath us ({attempts} attempts)")]
    ConcurrentModification { id: JobId, attempts: u32 },

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: JobId, from: JobState, to: JobState },

    #[error(transparent)]
    Store(StoreError),

    #[error("job service is shutting down")]
    ShuttingDown,
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => JobError::NotFound(id),
            other => JobError::Store(other),
        }
    }
}

impl JobError {
    /// Whether the same write could succeed if tried again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JobError::Store(StoreError::Unavailable(_)) | JobError::ConcurrentModification { .. }
        )
    }
}
