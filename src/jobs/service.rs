//! # Transcription Service
//!
//! The entry point the HTTP layer talks to. Wires the job store, admission
//! queue, execution pool, model registry and stuck-job sweep together and
//! exposes submit / status / result / cancel.
//!
//! ## Admission:
//! A queue slot is reserved *before* the job record is created, so a full
//! queue turns a request away without leaving a job behind.
//!
//! ## Cancellation:
//! Cancelling writes CANCELLED through the store first. Only then is the job
//! pulled from the queue (if still waiting) or its worker's token fired (if
//! running). A cancel that loses the race to completion changes nothing and
//! is reported as already terminal.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::jobs::error::JobError;
use crate::jobs::facade::{JobResultView, JobStatusView, StatusFacade};
use crate::jobs::job::{InputRef, Job, JobId, JobState, Transition};
use crate::jobs::pool::{ActiveJobs, ExecutionPool, PoolContext, StartAttempts};
use crate::jobs::queue::AdmissionQueue;
use crate::jobs::store::JobStore;
use crate::jobs::sweep::StuckJobSweeper;
use crate::jobs::transition::{TransitionOutcome, Transitioner};
use crate::transcription::model::ModelSize;
use crate::transcription::registry::ModelRegistry;

/// Tuning knobs for the scheduler, normally built from `SchedulerConfig`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_count: usize,
    pub max_queue_depth: usize,
    pub job_timeout: Duration,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub cas_retry_limit: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_queue_depth: 100,
            job_timeout: Duration::from_secs(300),
            stale_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            cas_retry_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queue_depth: usize,
    pub max_queue_depth: usize,
    pub running_jobs: usize,
    pub workers: usize,
    pub job_timeout_secs: u64,
    pub store_backend: &'static str,
}

pub struct TranscriptionService {
    transitioner: Transitioner,
    queue: Arc<AdmissionQueue>,
    models: Arc<ModelRegistry>,
    active: Arc<ActiveJobs>,
    facade: StatusFacade,
    settings: SchedulerSettings,
    pool: Mutex<Option<ExecutionPool>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TranscriptionService {
    /// Build the service, re-enqueue PENDING jobs left in the store, and
    /// start the workers and the sweep.
    pub async fn start(
        store: Arc<dyn JobStore>,
        models: Arc<ModelRegistry>,
        settings: SchedulerSettings,
    ) -> Result<Arc<Self>, JobError> {
        let transitioner = Transitioner::new(Arc::clone(&store), settings.cas_retry_limit);
        let queue = Arc::new(AdmissionQueue::new(settings.max_queue_depth));
        let active = Arc::new(ActiveJobs::new());

        let recovered = store.list_in_state(JobState::Pending).await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), store = store.name(), "Re-enqueueing pending jobs");
        }
        for job in &recovered {
            queue.restore(job.id, job.priority);
        }

        let pool = ExecutionPool::start(
            Arc::new(PoolContext {
                transitioner: transitioner.clone(),
                queue: Arc::clone(&queue),
                models: Arc::clone(&models),
                active: Arc::clone(&active),
                job_timeout: settings.job_timeout,
                start_attempts: StartAttempts::default(),
            }),
            settings.worker_count,
        );

        let shutdown = CancellationToken::new();
        let sweeper = StuckJobSweeper::new(
            transitioner.clone(),
            Arc::clone(&active),
            settings.stale_after,
            settings.sweep_interval,
        );
        let sweeper = tokio::spawn(sweeper.run(shutdown.clone()));

        Ok(Arc::new(Self {
            facade: StatusFacade::new(store, Arc::clone(&queue), Arc::clone(&active)),
            transitioner,
            queue,
            models,
            active,
            settings,
            pool: Mutex::new(Some(pool)),
            sweeper: Mutex::new(Some(sweeper)),
            shutdown,
        }))
    }

    /// Admit a new job. Fails fast with `Capacity` when the queue is full.
    pub async fn submit(&self, input_ref: InputRef, priority: i32, model_size: ModelSize) -> Result<JobId, JobError> {
        let reservation = self.queue.reserve()?;

        let job = Job::new(input_ref, priority, model_size);
        let id = self.transitioner.store().create(job).await?;
        reservation.commit(id, priority);

        tracing::info!(job_id = %id, priority, model = %model_size, "Job admitted");
        Ok(id)
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatusView, JobError> {
        self.facade.status(id).await
    }

    pub async fn result(&self, id: JobId) -> Result<JobResultView, JobError> {
        self.facade.result(id).await
    }

    pub async fn cancel(&self, id: JobId) -> Result<Job, JobError> {
        match self.transitioner.apply(id, Transition::Cancel).await? {
            TransitionOutcome::Applied { job, from } => {
                if from == JobState::Pending {
                    // No worker will start it now, so nothing reads the input again.
                    self.queue.remove(id);
                    job.input_ref.release().await;
                }
                // A worker may have popped the job already; its token covers
                // both the model wait and the transcription call.
                self.active.cancel(id);
                Ok(job)
            }
            TransitionOutcome::AlreadyTerminal(job) => Err(JobError::AlreadyTerminal { id, state: job.state }),
            TransitionOutcome::Skipped(job) => Ok(job),
        }
    }

    pub async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError> {
        let purged = self.transitioner.store().purge_terminal_before(cutoff).await?;
        tracing::info!(purged, cutoff = %cutoff, "Purged terminal jobs");
        Ok(purged)
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_depth: self.queue.len(),
            max_queue_depth: self.queue.max_depth(),
            running_jobs: self.active.len(),
            workers: self.settings.worker_count,
            job_timeout_secs: self.settings.job_timeout.as_secs(),
            store_backend: self.transitioner.store().name(),
        }
    }

    /// Stop admitting, let workers finish their current job, stop the sweep.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job service");
        self.queue.close();
        self.shutdown.cancel();

        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pool) = pool {
            pool.join().await;
        }
        let sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                tracing::error!(error = %e, "Sweep task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::tests::sample_result;
    use crate::jobs::job::ErrorDetail;
    use crate::jobs::store::InMemoryJobStore;
    use crate::transcription::testing::{CallStats, Script, ScriptedBackend};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::{HashMap, HashSet};

    fn settings(workers: usize, depth: usize) -> SchedulerSettings {
        SchedulerSettings {
            worker_count: workers,
            max_queue_depth: depth,
            job_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            cas_retry_limit: 5,
        }
    }

    async fn start(
        backend: ScriptedBackend,
        capacity: usize,
        settings: SchedulerSettings,
    ) -> (Arc<TranscriptionService>, Arc<CallStats>) {
        let stats = backend.stats();
        let models = Arc::new(ModelRegistry::new(Arc::new(backend), capacity));
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let service = TranscriptionService::start(store, models, settings).await.unwrap();
        (service, stats)
    }

    fn input(name: &str) -> InputRef {
        InputRef::new(format!("/tmp/{}", name), name)
    }

    async fn wait_for<F>(service: &TranscriptionService, id: JobId, check: F) -> JobStatusView
    where
        F: Fn(&JobStatusView) -> bool,
    {
        for _ in 0..2000 {
            let view = service.status(id).await.unwrap();
            if check(&view) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached the expected state", id);
    }

    async fn wait_terminal(service: &TranscriptionService, id: JobId) -> JobStatusView {
        wait_for(service, id, |view| view.status.is_terminal()).await
    }

    /// Occupy the only worker with a job that ignores cancellation.
    async fn occupy_worker(service: &TranscriptionService) -> JobId {
        let id = service.submit(input("blocker.wav"), 100, ModelSize::Base).await.unwrap();
        wait_for(service, id, |view| view.status == JobState::Processing).await;
        id
    }

    fn blocking_backend() -> ScriptedBackend {
        ScriptedBackend::new(Duration::from_millis(20)).with_script("blocker.wav", Script::Hang(Duration::from_secs(1)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_dequeues_first_then_fifo() {
        let (service, stats) = start(blocking_backend(), 1, settings(1, 10)).await;
        let blocker = occupy_worker(&service).await;

        let low_first = service.submit(input("low-1.wav"), 1, ModelSize::Base).await.unwrap();
        let high = service.submit(input("high.wav"), 5, ModelSize::Base).await.unwrap();
        let low_second = service.submit(input("low-2.wav"), 1, ModelSize::Base).await.unwrap();

        for id in [blocker, low_first, high, low_second] {
            assert_eq!(wait_terminal(&service, id).await.status, JobState::Completed);
        }
        assert_eq!(stats.started(), ["blocker.wav", "high.wav", "low-1.wav", "low-2.wav"]);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_never_exceed_model_capacity() {
        let (service, stats) = start(ScriptedBackend::new(Duration::from_millis(50)), 2, settings(6, 64)).await;

        let mut ids = Vec::new();
        for n in 0..24 {
            ids.push(service.submit(input(&format!("burst-{}.wav", n)), 0, ModelSize::Small).await.unwrap());
        }
        for id in ids {
            assert_eq!(wait_terminal(&service, id).await.status, JobState::Completed);
        }

        assert!(stats.max_active() <= 2, "saw {} concurrent calls", stats.max_active());
        assert_eq!(stats.active(), 0);
        assert_eq!(service.models().leased_count(), 0);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_pending_job_never_starts() {
        let (service, stats) = start(blocking_backend(), 1, settings(1, 10)).await;
        let blocker = occupy_worker(&service).await;

        let id = service.submit(input("doomed.wav"), 0, ModelSize::Base).await.unwrap();
        let cancelled = service.cancel(id).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert_eq!(service.stats().queue_depth, 0);

        wait_terminal(&service, blocker).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let view = service.status(id).await.unwrap();
        assert_eq!(view.status, JobState::Cancelled);
        assert!(view.started_at.is_none());
        assert!(!stats.started().contains(&"doomed.wav".to_string()));
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_pending_job_removes_its_input() {
        let (service, _stats) = start(blocking_backend(), 1, settings(1, 10)).await;
        let blocker = occupy_worker(&service).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queued.wav");
        std::fs::write(&path, b"RIFF").unwrap();
        let id = service
            .submit(InputRef::new(&path, "queued.wav"), 0, ModelSize::Base)
            .await
            .unwrap();

        service.cancel(id).await.unwrap();
        assert!(!path.exists());

        wait_terminal(&service, blocker).await;
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_job_stops_the_call() {
        let (service, stats) = start(ScriptedBackend::new(Duration::from_secs(600)), 1, settings(1, 10)).await;
        let id = service.submit(input("long.wav"), 0, ModelSize::Base).await.unwrap();
        wait_for(&service, id, |view| view.status == JobState::Processing).await;

        let cancelled = service.cancel(id).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.active(), 0);
        assert_eq!(service.models().leased_count(), 0);

        let view = service.status(id).await.unwrap();
        assert_eq!(view.status, JobState::Cancelled);
        assert_eq!(view.version, cancelled.version);

        let again = service.cancel(id).await.unwrap_err();
        assert!(matches!(again, JobError::AlreadyTerminal { state: JobState::Cancelled, .. }));
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_rejects_without_creating_a_job() {
        let (service, _) = start(blocking_backend(), 1, settings(1, 1)).await;
        occupy_worker(&service).await;

        service.submit(input("queued.wav"), 0, ModelSize::Base).await.unwrap();
        let err = service.submit(input("rejected.wav"), 0, ModelSize::Base).await.unwrap_err();
        assert_eq!(err, JobError::Capacity { max_depth: 1 });

        let store = service.transitioner.store();
        let pending = store.list_in_state(JobState::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].input_ref.file_name, "queued.wav");
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_before_completion_is_not_ready() {
        let (service, _) = start(blocking_backend(), 1, settings(1, 10)).await;
        occupy_worker(&service).await;

        let id = service.submit(input("later.wav"), 0, ModelSize::Base).await.unwrap();
        assert!(matches!(
            service.result(id).await,
            Err(JobError::NotReady { state: JobState::Pending, .. })
        ));

        wait_terminal(&service, id).await;
        let result = service.result(id).await.unwrap();
        assert_eq!(result.text, "transcript of later.wav");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_submits_get_unique_ids() {
        let (service, _) = start(ScriptedBackend::new(Duration::from_millis(1)), 2, settings(2, 200)).await;

        let handles: Vec<_> = (0..64)
            .map(|n| {
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.submit(input(&format!("{}.wav", n)), n % 3, ModelSize::Tiny).await })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.unwrap().unwrap()));
        }
        assert_eq!(ids.len(), 64);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_jobs_are_recovered_on_start() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let leftover = store.create(Job::new(input("leftover.wav"), 0, ModelSize::Base)).await.unwrap();

        let models = Arc::new(ModelRegistry::new(Arc::new(ScriptedBackend::new(Duration::from_millis(5))), 1));
        let service = TranscriptionService::start(store, models, settings(1, 4)).await.unwrap();

        assert_eq!(wait_terminal(&service, leftover).await.status, JobState::Completed);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_admission() {
        let (service, _) = start(ScriptedBackend::new(Duration::from_millis(1)), 1, settings(2, 4)).await;
        service.shutdown().await;

        let err = service.submit(input("late.wav"), 0, ModelSize::Base).await.unwrap_err();
        assert_eq!(err, JobError::ShuttingDown);
    }

    /// Random mixes of start/complete/fail/cancel/sweep writes racing on a
    /// handful of jobs must only ever walk the legal state graph.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_random_interleavings_stay_on_the_state_graph() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let transitioner = Transitioner::new(Arc::clone(&store), 50);

        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(store.create(Job::new(input("random.wav"), 0, ModelSize::Tiny)).await.unwrap());
        }

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut handles = Vec::new();
        for _ in 0..200 {
            let id = ids[rng.gen_range(0..ids.len())];
            let op = rng.gen_range(0..5);
            let transitioner = transitioner.clone();
            handles.push(tokio::spawn(async move {
                let outcome = match op {
                    0 => transitioner.apply(id, Transition::Start).await,
                    1 => transitioner.apply(id, Transition::Complete(sample_result())).await,
                    2 => {
                        let detail = ErrorDetail::transcription_failure("random");
                        transitioner.apply(id, Transition::Fail(detail)).await
                    }
                    3 => transitioner.apply(id, Transition::Cancel).await,
                    // Same guarded write the stuck-job sweep issues.
                    _ => {
                        let detail = ErrorDetail::worker_lost("swept");
                        transitioner
                            .apply_guarded(id, Transition::Fail(detail), |job| job.state == JobState::Processing)
                            .await
                    }
                };
                match outcome {
                    Ok(TransitionOutcome::Applied { job, from }) => Some((job.id, from, job.state, job.version)),
                    Ok(_) => None,
                    Err(JobError::InvalidTransition { .. }) => None,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }));
        }

        let mut versions: HashMap<JobId, Vec<u64>> = HashMap::new();
        for handle in handles {
            if let Some((id, from, to, version)) = handle.await.unwrap() {
                assert!(from.can_transition_to(to), "{} -> {}", from, to);
                versions.entry(id).or_default().push(version);
            }
        }

        for id in ids {
            let job = store.get(id).await.unwrap();
            assert!(job.is_consistent(), "{:?}", job);

            let mut seen = versions.remove(&id).unwrap_or_default();
            seen.sort_unstable();
            let expected: Vec<u64> = (2..=job.version).collect();
            assert_eq!(seen, expected, "every write must produce a fresh version");
        }
    }
}
