//! Periodic sweep for jobs abandoned mid-PROCESSING.
//!
//! A job whose `started_at` is older than the stale threshold is failed
//! with `WorkerLost`. The write is guarded on the record the sweep judged
//! to be stale, so a worker completing the job at the same moment wins or
//! loses cleanly through the version check.
//!
//! `started_at` is wall-clock time while worker deadlines run on the
//! monotonic clock, so a wall-clock jump forward could make a healthy job
//! look stale. A job still held by a worker in this process is only failed
//! once its monotonic run time is past the threshold too.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::jobs::error::JobError;
use crate::jobs::job::{ErrorDetail, Job, JobState, Transition};
use crate::jobs::pool::ActiveJobs;
use crate::jobs::transition::{TransitionOutcome, Transitioner};

pub struct StuckJobSweeper {
    transitioner: Transitioner,
    active: Arc<ActiveJobs>,
    stale_after: Duration,
    interval: Duration,
}

impl StuckJobSweeper {
    pub fn new(transitioner: Transitioner, active: Arc<ActiveJobs>, stale_after: Duration, interval: Duration) -> Self {
        Self {
            transitioner,
            active,
            stale_after,
            interval,
        }
    }

    fn held_by_live_worker(&self, job: &Job) -> bool {
        self.active
            .progress(job.id)
            .is_some_and(|(_, running_for)| running_for < self.stale_after)
    }

    /// Fail every stale PROCESSING job once. Returns how many were failed.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, JobError> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = now - stale_after;

        let candidates = self
            .transitioner
            .store()
            .list_in_state(JobState::Processing)
            .await?;

        let mut failed = 0;
        for job in candidates.into_iter().filter(|job| is_stale(job.started_at, cutoff)) {
            if self.held_by_live_worker(&job) {
                tracing::debug!(job_id = %job.id, "Skipping job still running on a live worker");
                continue;
            }
            let detail = ErrorDetail::worker_lost(format!(
                "no progress for more than {}s; the worker is presumed lost",
                self.stale_after.as_secs()
            ));
            let guard = |current: &Job| {
                current.state == JobState::Processing && is_stale(current.started_at, cutoff)
            };

            match self.transitioner.apply_guarded(job.id, Transition::Fail(detail), guard).await {
                Ok(TransitionOutcome::Applied { job, .. }) => {
                    tracing::warn!(job_id = %job.id, started_at = ?job.started_at, "Failed stuck job");
                    job.input_ref.release().await;
                    failed += 1;
                }
                Ok(_) => {}
                // Next tick retries whatever was contended.
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Could not fail stuck job"),
            }
        }
        Ok(failed)
    }

    /// Sweep every interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "Stuck-job sweep started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(0) => {}
                        Ok(count) => tracing::info!(count, "Sweep failed stuck jobs"),
                        Err(e) => tracing::error!(error = %e, "Sweep could not list processing jobs"),
                    }
                }
            }
        }
        tracing::info!("Stuck-job sweep stopped");
    }
}

fn is_stale(started_at: Option<DateTime<Utc>>, cutoff: DateTime<Utc>) -> bool {
    started_at.is_some_and(|at| at < cutoff)
}
