//! # Job Store
//!
//! Keyed record of every job: the single source of truth for status
//! queries and the only place a job's state can change.
//!
//! ## Optimistic Concurrency:
//! Writers never lock a job across a transcription call. Instead they read
//! a snapshot, decide what they want, and submit a mutator together with the
//! version they read. The store applies the mutator to a copy and persists
//! it only if the stored version still matches, bumping `version` by one.
//! A mismatch hands back the current record so the caller can re-evaluate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::jobs::error::StoreError;
use crate::jobs::job::{Job, JobId, JobState, TransitionError};

/// Change to apply to a stored job. Refusing (e.g. the job is already
/// terminal) leaves the record untouched.
pub type Mutator<'a> = &'a (dyn Fn(&mut Job) -> Result<(), TransitionError> + Send + Sync);

#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write went through; carries the record as now stored.
    Applied(Job),
    /// Someone else wrote first; carries the current record.
    VersionMismatch(Job),
    /// The versions matched but the mutator refused the change.
    Rejected { current: Job, reason: TransitionError },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Human-readable backend name for logs and health output.
    fn name(&self) -> &'static str;

    async fn create(&self, job: Job) -> Result<JobId, StoreError>;

    async fn get(&self, id: JobId) -> Result<Job, StoreError>;

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<CasOutcome, StoreError>;

    /// All jobs currently in `state`, oldest first.
    async fn list_in_state(&self, state: JobState) -> Result<Vec<Job>, StoreError>;

    /// Delete terminal jobs that completed before `cutoff`.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Apply `mutator` to a copy of `current` as the next version.
///
/// Shared by every backend so the version rule lives in one place.
pub(crate) fn next_version(current: &Job, mutator: Mutator<'_>) -> Result<Job, TransitionError> {
    let mut next = current.clone();
    mutator(&mut next)?;
    next.id = current.id;
    next.version = current.version + 1;
    debug_assert!(next.is_consistent(), "mutator produced an inconsistent job");
    Ok(next)
}

/// Volatile store backed by a `HashMap`. Jobs are lost on restart.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, job: Job) -> Result<JobId, StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<CasOutcome, StoreError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if current.version != expected_version {
            return Ok(CasOutcome::VersionMismatch(current.clone()));
        }

        match next_version(current, mutator) {
            Ok(next) => {
                *current = next.clone();
                Ok(CasOutcome::Applied(next))
            }
            Err(reason) => Ok(CasOutcome::Rejected {
                current: current.clone(),
                reason,
            }),
        }
    }

    async fn list_in_state(&self, state: JobState) -> Result<Vec<Job>, StoreError> {
        let mut matching: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        matching.sort_by_key(|job| job.created_at);
        Ok(matching)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.state.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok(before - jobs.len())
    }
}
