//! # Job Model
//!
//! The job record tracked from admission to a terminal state, together with
//! the state machine that decides which transitions are legal.
//!
//! ## State Graph:
//! ```text
//! PENDING ──▶ PROCESSING ──▶ COMPLETED
//!    │             ├───────▶ FAILED
//!    │             └───────▶ CANCELLED
//!    └───────────────────────▶ CANCELLED
//! ```
//! COMPLETED, FAILED and CANCELLED are terminal: nothing leaves them.
//!
//! ## Versioning:
//! `version` starts at 1 and is bumped by the job store on every successful
//! write. `Job::apply` never touches it, so the only way a record changes is
//! through a version-checked compare-and-swap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::transcription::model::ModelSize;

/// Opaque external handle for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Whether the state graph has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Processing => "PROCESSING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    /// Human-readable message shown to polling clients.
    pub fn description(&self) -> &'static str {
        match self {
            JobState::Pending => "Transcription job is pending",
            JobState::Processing => "Transcription is in progress",
            JobState::Completed => "Transcription completed successfully",
            JobState::Failed => "Transcription failed",
            JobState::Cancelled => "Transcription job was cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown job state: {}", s))
    }
}

/// Handle to a stored audio upload. The engine never sees raw bytes, only
/// this reference, which the transcription backend resolves itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    /// Where the upload layer stored the payload
    pub path: PathBuf,
    /// Name the client uploaded the file under
    pub file_name: String,
}

impl InputRef {
    pub fn new(path: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file_name: file_name.into(),
        }
    }

    /// Delete the stored audio once no worker will read it again. A file
    /// that is already gone is not an error.
    pub async fn release(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed job input"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "Could not remove job input"),
        }
    }
}

/// One timed span of transcribed text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub confidence: Option<f32>,
}

/// Payload of a COMPLETED job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    /// Detected or requested language (ISO 639-1)
    pub language: Option<String>,
    pub segments: Vec<Segment>,
    /// Overall confidence (0.0 to 1.0), when the backend can estimate one
    pub confidence: Option<f32>,
    pub audio_duration_secs: Option<f64>,
    pub model_used: ModelSize,
    pub processing_time_ms: u64,
}

/// Why an execution ended in FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// The model pool could not provide an instance of the requested size
    ModelUnavailable,
    /// The transcription call itself returned an error
    TranscriptionFailure,
    /// The per-job deadline passed
    Timeout,
    /// The stuck-job sweep found the job abandoned mid-PROCESSING
    WorkerLost,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ModelUnavailable => "ModelUnavailable",
            FailureReason::TranscriptionFailure => "TranscriptionFailure",
            FailureReason::Timeout => "Timeout",
            FailureReason::WorkerLost => "WorkerLost",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ModelUnavailable" => Ok(FailureReason::ModelUnavailable),
            "TranscriptionFailure" => Ok(FailureReason::TranscriptionFailure),
            "Timeout" => Ok(FailureReason::Timeout),
            "WorkerLost" => Ok(FailureReason::WorkerLost),
            _ => Err(format!("Unknown failure reason: {}", s)),
        }
    }
}

/// Structured failure carried by a FAILED job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub reason: FailureReason,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn model_unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureReason::ModelUnavailable, message)
    }

    pub fn transcription_failure(message: impl Into<String>) -> Self {
        Self::new(FailureReason::TranscriptionFailure, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Timeout, message)
    }

    pub fn worker_lost(message: impl Into<String>) -> Self {
        Self::new(FailureReason::WorkerLost, message)
    }
}

/// A requested move along the state graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start,
    Complete(TranscriptionResult),
    Fail(ErrorDetail),
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobState {
        match self {
            Transition::Start => JobState::Processing,
            Transition::Complete(_) => JobState::Completed,
            Transition::Fail(_) => JobState::Failed,
            Transition::Cancel => JobState::Cancelled,
        }
    }
}

/// Why `Job::apply` refused a transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job is already terminal ({0})")]
    AlreadyTerminal(JobState),

    #[error("cannot move a job from {from} to {to}")]
    Invalid { from: JobState, to: JobState },
}

/// One transcription request from admission through its terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub priority: i32,
    pub model_size: ModelSize,
    pub input_ref: InputRef,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<TranscriptionResult>,
    pub error_detail: Option<ErrorDetail>,
    pub version: u64,
}

impl Job {
    /// Create a fresh PENDING job with a newly generated id.
    pub fn new(input_ref: InputRef, priority: i32, model_size: ModelSize) -> Self {
        Self {
            id: JobId::new(),
            state: JobState::Pending,
            priority,
            model_size,
            input_ref,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error_detail: None,
            version: 1,
        }
    }

    /// Apply a transition in place, stamping the matching timestamp.
    ///
    /// Terminal jobs reject everything with `AlreadyTerminal`, which callers
    /// treat as an idempotent no-op rather than a failure.
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.state));
        }

        let target = transition.target();
        if !self.state.can_transition_to(target) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: target,
            });
        }

        match transition {
            Transition::Start => {
                self.started_at = Some(now);
            }
            Transition::Complete(result) => {
                self.result = Some(result.clone());
                self.completed_at = Some(now);
            }
            Transition::Fail(detail) => {
                self.error_detail = Some(detail.clone());
                self.completed_at = Some(now);
            }
            Transition::Cancel => {
                self.completed_at = Some(now);
            }
        }
        self.state = target;
        Ok(())
    }

    /// `result` is present only when COMPLETED, `error_detail` only when
    /// FAILED, and the timestamps follow the state.
    pub fn is_consistent(&self) -> bool {
        let payload_ok = match self.state {
            JobState::Completed => self.result.is_some() && self.error_detail.is_none(),
            JobState::Failed => self.result.is_none() && self.error_detail.is_some(),
            _ => self.result.is_none() && self.error_detail.is_none(),
        };
        let timestamps_ok = match self.state {
            JobState::Pending => self.started_at.is_none() && self.completed_at.is_none(),
            JobState::Processing => self.started_at.is_some() && self.completed_at.is_none(),
            _ => self.completed_at.is_some(),
        };
        payload_ok && timestamps_ok && self.version >= 1
    }
}
