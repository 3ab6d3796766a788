//! Retrying transition helper on top of `JobStore::compare_and_swap`.
//!
//! Every writer (workers, the sweep, cancellation) goes through here, so
//! there is one place that re-reads on a version mismatch, treats terminal
//! jobs as an idempotent no-op, and logs the transition.

use chrono::Utc;
use std::sync::Arc;

use crate::jobs::error::JobError;
use crate::jobs::job::{Job, JobId, JobState, Transition, TransitionError};
use crate::jobs::store::{CasOutcome, JobStore};

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied { job: Job, from: JobState },
    /// The job had already reached a terminal state; nothing was written.
    AlreadyTerminal(Job),
    /// The guard declined to act on the current record.
    Skipped(Job),
}

impl TransitionOutcome {
    pub fn job(&self) -> &Job {
        match self {
            TransitionOutcome::Applied { job, .. } => job,
            TransitionOutcome::AlreadyTerminal(job) => job,
            TransitionOutcome::Skipped(job) => job,
        }
    }
}

#[derive(Clone)]
pub struct Transitioner {
    store: Arc<dyn JobStore>,
    retry_limit: u32,
}

impl Transitioner {
    pub fn new(store: Arc<dyn JobStore>, retry_limit: u32) -> Self {
        Self {
            store,
            retry_limit: retry_limit.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn apply(&self, id: JobId, transition: Transition) -> Result<TransitionOutcome, JobError> {
        self.apply_guarded(id, transition, |_| true).await
    }

    /// Like `apply`, but only writes while `guard` accepts the record read
    /// in the same attempt. The sweep uses this to fail a job only at the
    /// version it judged to be stale.
    pub async fn apply_guarded<G>(
        &self,
        id: JobId,
        transition: Transition,
        guard: G,
    ) -> Result<TransitionOutcome, JobError>
    where
        G: Fn(&Job) -> bool + Send + Sync,
    {
        let target = transition.target();
        let mutate = |job: &mut Job| job.apply(&transition, Utc::now());

        let mut current = self.store.get(id).await?;
        for attempt in 1..=self.retry_limit {
            if current.state.is_terminal() {
                return Ok(TransitionOutcome::AlreadyTerminal(current));
            }
            if !guard(&current) {
                return Ok(TransitionOutcome::Skipped(current));
            }

            let from = current.state;
            match self.store.compare_and_swap(id, current.version, &mutate).await? {
                CasOutcome::Applied(job) => {
                    tracing::info!(
                        job_id = %id,
                        from = %from,
                        to = %target,
                        version = job.version,
                        "Job transition"
                    );
                    return Ok(TransitionOutcome::Applied { job, from });
                }
                CasOutcome::VersionMismatch(latest) => {
                    tracing::debug!(
                        job_id = %id,
                        expected = current.version,
                        found = latest.version,
                        attempt,
                        "Version mismatch, re-reading"
                    );
                    current = latest;
                }
                CasOutcome::Rejected { current, reason } => {
                    return match reason {
                        TransitionError::AlreadyTerminal(_) => Ok(TransitionOutcome::AlreadyTerminal(current)),
                        TransitionError::Invalid { from, to } => {
                            Err(JobError::InvalidTransition { id, from, to })
                        }
                    };
                }
            }
        }

        tracing::warn!(job_id = %id, to = %target, attempts = self.retry_limit, "Giving up on contended job");
        Err(JobError::ConcurrentModification {
            id,
            attempts: self.retry_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::error::StoreError;
    use crate::jobs::job::tests::{sample_input, sample_result};
    use crate::jobs::job::ErrorDetail;
    use crate::jobs::store::{InMemoryJobStore, Mutator};
    use crate::transcription::model::ModelSize;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn setup() -> (Transitioner, JobId) {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let id = store.create(Job::new(sample_input(), 0, ModelSize::Base)).await.unwrap();
        (Transitioner::new(store, 5), id)
    }

    #[tokio::test]
    async fn test_apply_reports_from_state() {
        let (transitioner, id) = setup().await;
        let outcome = transitioner.apply(id, Transition::Start).await.unwrap();
        match outcome {
            TransitionOutcome::Applied { job, from } => {
                assert_eq!(from, JobState::Pending);
                assert_eq!(job.state, JobState::Processing);
                assert_eq!(job.version, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_job_is_idempotent_noop() {
        let (transitioner, id) = setup().await;
        transitioner.apply(id, Transition::Cancel).await.unwrap();

        let outcome = transitioner
            .apply(id, Transition::Fail(ErrorDetail::timeout("late")))
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::AlreadyTerminal(ref job) if job.state == JobState::Cancelled));
        assert_eq!(outcome.job().version, 2);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_an_error() {
        let (transitioner, id) = setup().await;
        let err = transitioner
            .apply(id, Transition::Complete(sample_result()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { from: JobState::Pending, to: JobState::Completed, .. }));
    }

    #[tokio::test]
    async fn test_guard_can_skip() {
        let (transitioner, id) = setup().await;
        let outcome = transitioner
            .apply_guarded(id, Transition::Start, |job| job.priority > 10)
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (transitioner, _) = setup().await;
        let missing = JobId::new();
        assert_eq!(
            transitioner.apply(missing, Transition::Cancel).await.unwrap_err(),
            JobError::NotFound(missing)
        );
    }

    /// Store whose CAS always reports a conflicting writer.
    struct AlwaysConflicting {
        inner: InMemoryJobStore,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl JobStore for AlwaysConflicting {
        fn name(&self) -> &'static str {
            "conflicting"
        }

        async fn create(&self, job: Job) -> Result<JobId, StoreError> {
            self.inner.create(job).await
        }

        async fn get(&self, id: JobId) -> Result<Job, StoreError> {
            self.inner.get(id).await
        }

        async fn compare_and_swap(
            &self,
            id: JobId,
            _expected_version: u64,
            _mutator: Mutator<'_>,
        ) -> Result<CasOutcome, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.inner.get(id).await.map(CasOutcome::VersionMismatch)
        }

        async fn list_in_state(&self, state: JobState) -> Result<Vec<Job>, StoreError> {
            self.inner.list_in_state(state).await
        }

        async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.purge_terminal_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let store = Arc::new(AlwaysConflicting {
            inner: InMemoryJobStore::new(),
            attempts: AtomicU32::new(0),
        });
        let id = store.create(Job::new(sample_input(), 0, ModelSize::Base)).await.unwrap();
        let transitioner = Transitioner::new(store.clone(), 3);

        let err = transitioner.apply(id, Transition::Start).await.unwrap_err();
        assert_eq!(err, JobError::ConcurrentModification { id, attempts: 3 });
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    }
}
