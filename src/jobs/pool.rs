//! # Execution Pool
//!
//! A fixed set of worker tasks pulling job ids off the admission queue.
//!
//! ## Worker Loop:
//! 1. Dequeue the next job id (waits while the queue is empty)
//! 2. PENDING → PROCESSING through the store; a job that is no longer
//!    PENDING (usually cancelled) is skipped
//! 3. Lease a model instance of the requested size
//! 4. Run the transcription call under the job deadline
//! 5. Release the lease, delete the input file, then write COMPLETED or FAILED
//!
//! ## Failure Containment:
//! Steps 3 and 4 share one deadline. On expiry the call's cancellation
//! token fires and the call future is dropped. A panic inside the call is
//! caught and recorded as a transcription failure; the worker keeps going.
//!
//! ## Store Hiccups:
//! A start write that fails transiently puts the job back in the queue
//! after a backoff, up to `MAX_START_ATTEMPTS` times. Past that the job is
//! left PENDING for restart recovery. The terminal write is retried in
//! place a few times; if it still fails the job stays PROCESSING and the
//! stuck-job sweep eventually fails it.

use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::jobs::error::JobError;
use crate::jobs::job::{ErrorDetail, Job, JobId, Transition, TranscriptionResult};
use crate::jobs::queue::{AdmissionQueue, Dequeued};
use crate::jobs::transition::{TransitionOutcome, Transitioner};
use crate::transcription::backend::TranscriptionRequest;
use crate::transcription::registry::{ModelError, ModelRegistry};

/// Transient start failures tolerated per job before it is parked.
pub const MAX_START_ATTEMPTS: u32 = 6;
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const START_BACKOFF: Duration = Duration::from_millis(500);
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// What a running job is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    WaitingForModel,
    Transcribing,
}

struct ActiveEntry {
    cancel: CancellationToken,
    stage: Stage,
    started: Instant,
}

/// Jobs currently held by a worker, with the token that stops them.
#[derive(Default)]
pub struct ActiveJobs {
    inner: Mutex<HashMap<JobId, ActiveEntry>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, ActiveEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `id` and hand back its cancellation token. Registration happens
    /// before the job is marked PROCESSING, so a cancel that lands right
    /// after that write always finds the token.
    pub fn register(&self, id: JobId) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.lock().insert(
            id,
            ActiveEntry {
                cancel: cancel.clone(),
                stage: Stage::WaitingForModel,
                started: Instant::now(),
            },
        );
        cancel
    }

    pub fn set_stage(&self, id: JobId, stage: Stage) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.stage = stage;
        }
    }

    /// Fire the job's token. Returns false if no worker holds the job.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.lock().get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn progress(&self, id: JobId) -> Option<(Stage, Duration)> {
        self.lock()
            .get(&id)
            .map(|entry| (entry.stage, entry.started.elapsed()))
    }

    pub fn remove(&self, id: JobId) {
        self.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a job from `ActiveJobs` however the worker leaves it.
struct Registration<'a> {
    active: &'a ActiveJobs,
    id: JobId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.active.remove(self.id);
    }
}

/// Failed start attempts per job, cleared once the job starts or is given up on.
#[derive(Default)]
pub struct StartAttempts {
    inner: Mutex<HashMap<JobId, u32>>,
}

impl StartAttempts {
    fn record_failure(&self, id: JobId) -> u32 {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let attempts = inner.entry(id).or_insert(0);
        *attempts += 1;
        *attempts
    }

    fn clear(&self, id: JobId) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }

    #[cfg(test)]
    pub fn get(&self, id: JobId) -> u32 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
            .unwrap_or(0)
    }
}

/// Everything a worker needs, shared by all workers.
pub struct PoolContext {
    pub transitioner: Transitioner,
    pub queue: Arc<AdmissionQueue>,
    pub models: Arc<ModelRegistry>,
    pub active: Arc<ActiveJobs>,
    pub job_timeout: Duration,
    pub start_attempts: StartAttempts,
}

pub struct ExecutionPool {
    workers: Vec<JoinHandle<()>>,
}

impl ExecutionPool {
    pub fn start(ctx: Arc<PoolContext>, worker_count: usize) -> Self {
        tracing::info!(workers = worker_count, timeout_secs = ctx.job_timeout.as_secs(), "Starting execution pool");
        let workers = (0..worker_count)
            .map(|worker_id| tokio::spawn(worker_loop(Arc::clone(&ctx), worker_id)))
            .collect();
        Self { workers }
    }

    /// Wait for every worker to exit. Close the queue first.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(ctx: Arc<PoolContext>, worker_id: usize) {
    tracing::debug!(worker_id, "Worker started");
    while let Some(next) = ctx.queue.pop().await {
        let span = tracing::info_span!("job", job_id = %next.job_id, worker_id);
        run_job(&ctx, next).instrument(span).await;
    }
    tracing::debug!(worker_id, "Worker stopped");
}

/// How one execution ended, before it is written back.
enum Execution {
    Completed(TranscriptionResult),
    Failed(ErrorDetail),
    /// The job was cancelled while running; its state is already CANCELLED.
    Cancelled,
}

async fn run_job(ctx: &PoolContext, next: Dequeued) {
    let id = next.job_id;
    let cancel = ctx.active.register(id);
    let _registration = Registration {
        active: &ctx.active,
        id,
    };

    let job = match ctx.transitioner.apply(id, Transition::Start).await {
        Ok(TransitionOutcome::Applied { job, .. }) => {
            ctx.start_attempts.clear(id);
            job
        }
        Ok(other) => {
            ctx.start_attempts.clear(id);
            tracing::debug!(state = %other.job().state, "Skipping job that is no longer pending");
            return;
        }
        Err(e) => {
            handle_start_failure(ctx, next, e);
            return;
        }
    };

    let deadline = Instant::now() + ctx.job_timeout;
    let execution = execute(ctx, &job, deadline, &cancel).await;
    job.input_ref.release().await;

    let transition = match execution {
        Execution::Completed(result) => Transition::Complete(result),
        Execution::Failed(detail) => {
            tracing::warn!(reason = %detail.reason, message = %detail.message, "Job failed");
            Transition::Fail(detail)
        }
        Execution::Cancelled => {
            tracing::info!("Job cancelled while running");
            return;
        }
    };

    record_outcome(ctx, id, transition).await;
}

/// Put a job whose start write failed back in line, or park it once it has
/// used up its attempts.
fn handle_start_failure(ctx: &PoolContext, next: Dequeued, error: JobError) {
    let id = next.job_id;
    if !error.is_transient() {
        ctx.start_attempts.clear(id);
        tracing::error!(error = %error, "Could not start job");
        return;
    }

    let attempts = ctx.start_attempts.record_failure(id);
    if attempts >= MAX_START_ATTEMPTS {
        ctx.start_attempts.clear(id);
        // PENDING cannot move to FAILED, so the job waits for restart recovery.
        tracing::error!(error = %error, attempts, "Giving up on starting job, leaving it pending");
        return;
    }

    let backoff = START_BACKOFF * 2u32.pow(attempts - 1);
    tracing::warn!(error = %error, attempts, backoff_ms = backoff.as_millis() as u64, "Could not start job, requeueing");
    let queue = Arc::clone(&ctx.queue);
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        queue.restore(next.job_id, next.priority);
    });
}

/// Write the terminal state, retrying transient store failures in place.
async fn record_outcome(ctx: &PoolContext, id: JobId, transition: Transition) {
    for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
        match ctx.transitioner.apply(id, transition.clone()).await {
            Ok(TransitionOutcome::AlreadyTerminal(current)) => {
                tracing::info!(state = %current.state, "Job already terminal, dropping outcome");
                return;
            }
            Ok(_) => return,
            Err(e) if e.is_transient() && attempt < TERMINAL_WRITE_ATTEMPTS => {
                tracing::warn!(error = %e, attempt, "Could not record job outcome, retrying");
                tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
            }
            Err(e) => {
                tracing::error!(error = %e, attempt, "Could not record job outcome");
                return;
            }
        }
    }
}

/// Steps 3 and 4 of the loop. The lease is dropped on return, so the
/// instance is back in the pool before the terminal state is written.
async fn execute(ctx: &PoolContext, job: &Job, deadline: Instant, cancel: &CancellationToken) -> Execution {
    let acquired = timeout_at(deadline, ctx.models.acquire(job.model_size, cancel)).await;
    let mut lease = match acquired {
        Ok(Ok(lease)) => lease,
        Ok(Err(ModelError::Cancelled)) => return Execution::Cancelled,
        Ok(Err(e)) => return Execution::Failed(ErrorDetail::model_unavailable(e.to_string())),
        Err(_) => {
            return Execution::Failed(ErrorDetail::timeout(format!(
                "no {} model became available within {}s",
                job.model_size,
                ctx.job_timeout.as_secs()
            )))
        }
    };

    ctx.active.set_stage(job.id, Stage::Transcribing);
    let call_cancel = cancel.child_token();
    let request = TranscriptionRequest {
        input: job.input_ref.clone(),
        deadline,
        cancel: call_cancel.clone(),
    };

    let started = Instant::now();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        call = timeout_at(deadline, AssertUnwindSafe(lease.transcribe(&request)).catch_unwind()) => Some(call),
    };
    let elapsed = started.elapsed();

    match outcome {
        None => {
            lease.discard();
            Execution::Cancelled
        }
        Some(Err(_)) => {
            call_cancel.cancel();
            lease.discard();
            lease.record_usage(elapsed, false);
            Execution::Failed(ErrorDetail::timeout(format!(
                "transcription exceeded the {}s deadline",
                ctx.job_timeout.as_secs()
            )))
        }
        Some(Ok(Err(panic))) => {
            lease.discard();
            lease.record_usage(elapsed, false);
            Execution::Failed(ErrorDetail::transcription_failure(format!(
                "transcription panicked: {}",
                panic_message(panic.as_ref())
            )))
        }
        Some(Ok(Ok(Err(e)))) => {
            if cancel.is_cancelled() {
                return Execution::Cancelled;
            }
            lease.record_usage(elapsed, false);
            Execution::Failed(ErrorDetail::transcription_failure(format!("{:#}", e)))
        }
        Some(Ok(Ok(Ok(output)))) => {
            lease.record_usage(elapsed, true);
            Execution::Completed(TranscriptionResult {
                text: output.text,
                language: output.language,
                segments: output.segments,
                confidence: output.confidence,
                audio_duration_secs: output.audio_duration_secs,
                model_used: lease.size(),
                processing_time_ms: elapsed.as_millis() as u64,
            })
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
