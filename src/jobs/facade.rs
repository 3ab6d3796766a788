//! # Status/Result Facade
//!
//! Read-only view of jobs for polling clients. Every answer comes straight
//! from the job store, so a poll always reflects the latest committed
//! write. Nothing here waits on the execution pool: the progress hint reads
//! the queue and the active-job table without blocking on either.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::jobs::error::JobError;
use crate::jobs::job::{ErrorDetail, Job, JobId, JobState, Segment};
use crate::jobs::pool::{ActiveJobs, Stage};
use crate::jobs::queue::AdmissionQueue;
use crate::jobs::store::JobStore;
use crate::transcription::model::ModelSize;

/// Best-effort progress information.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressHint {
    Queued { position: usize },
    Running { stage: Stage, elapsed_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobState,
    pub message: &'static str,
    pub model_size: ModelSize,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_hint: Option<ProgressHint>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResultView {
    pub job_id: JobId,
    pub file_name: String,
    pub text: String,
    pub language: Option<String>,
    pub confidence: Option<f32>,
    pub audio_duration_secs: Option<f64>,
    pub model_used: ModelSize,
    pub processing_time_ms: u64,
    pub segments: Vec<Segment>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct StatusFacade {
    store: Arc<dyn JobStore>,
    queue: Arc<AdmissionQueue>,
    active: Arc<ActiveJobs>,
}

impl StatusFacade {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<AdmissionQueue>, active: Arc<ActiveJobs>) -> Self {
        Self { store, queue, active }
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatusView, JobError> {
        let job = self.store.get(id).await?;
        let progress_hint = self.progress_hint(&job);

        Ok(JobStatusView {
            job_id: job.id,
            status: job.state,
            message: job.state.description(),
            model_size: job.model_size,
            priority: job.priority,
            progress_hint,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error_detail: job.error_detail,
            version: job.version,
        })
    }

    /// The transcript of a COMPLETED job; `NotReady` for every other state.
    pub async fn result(&self, id: JobId) -> Result<JobResultView, JobError> {
        let job = self.store.get(id).await?;

        match (job.state, job.result) {
            (JobState::Completed, Some(result)) => Ok(JobResultView {
                job_id: job.id,
                file_name: job.input_ref.file_name,
                text: result.text,
                language: result.language,
                confidence: result.confidence,
                audio_duration_secs: result.audio_duration_secs,
                model_used: result.model_used,
                processing_time_ms: result.processing_time_ms,
                segments: result.segments,
                completed_at: job.completed_at,
            }),
            (state, _) => Err(JobError::NotReady {
                id,
                state,
                error_detail: job.error_detail,
            }),
        }
    }

    fn progress_hint(&self, job: &Job) -> Option<ProgressHint> {
        match job.state {
            JobState::Pending => self
                .queue
                .position(job.id)
                .map(|position| ProgressHint::Queued { position }),
            JobState::Processing => self.active.progress(job.id).map(|(stage, elapsed)| ProgressHint::Running {
                stage,
                elapsed_secs: elapsed.as_secs(),
            }),
            _ => None,
        }
    }
}
