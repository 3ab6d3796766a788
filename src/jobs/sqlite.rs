//! # SQLite Job Store
//!
//! Durable `JobStore` backed by a single SQLite table. The `version` column
//! carries the optimistic-concurrency check: every update is issued as
//! `UPDATE ... WHERE job_id = ? AND version = ?`, so a write based on a stale
//! read touches zero rows and is reported as a version mismatch.
//!
//! rusqlite is synchronous. Each call runs on the blocking thread pool with
//! the connection behind a mutex; the mutator itself is applied on the async
//! side between the read and the conditional update.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::jobs::error::StoreError;
use crate::jobs::job::{ErrorDetail, InputRef, Job, JobId, JobState, TranscriptionResult};
use crate::jobs::store::{next_version, CasOutcome, JobStore, Mutator};

const COLUMNS: &str = "job_id, state, priority, model_size, input_path, input_name, \
                       created_at, started_at, completed_at, result_json, error_reason, error_message, version";

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("{context}: {e}"))
}

impl SqliteJobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| storage_err("creating database directory", e))?;
        }
        let conn = Connection::open(path).map_err(|e| storage_err("opening database", e))?;
        tracing::info!(path = %path.display(), "Opened SQLite job store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| storage_err("opening in-memory database", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("database connection lock poisoned".to_string()))?;
            op(&conn)
        })
        .await
        .map_err(|e| storage_err("storage task failed", e))?
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            job_id        TEXT PRIMARY KEY,
            state         TEXT NOT NULL,
            priority      INTEGER NOT NULL DEFAULT 0,
            model_size    TEXT NOT NULL,
            input_path    TEXT NOT NULL,
            input_name    TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            started_at    TEXT,
            completed_at  TEXT,
            result_json   TEXT,
            error_reason  TEXT,
            error_message TEXT,
            version       INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_state
            ON jobs(state, created_at);
        ",
    )
    .map_err(|e| storage_err("migrating job table", e))
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed width so lexical order in SQL matches time order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| storage_err("corrupt timestamp", e))
}

/// A `jobs` row as stored, before parsing back into a `Job`.
struct JobRow {
    job_id: String,
    state: String,
    priority: i32,
    model_size: String,
    input_path: String,
    input_name: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    result_json: Option<String>,
    error_reason: Option<String>,
    error_message: Option<String>,
    version: i64,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            state: row.get(1)?,
            priority: row.get(2)?,
            model_size: row.get(3)?,
            input_path: row.get(4)?,
            input_name: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            result_json: row.get(9)?,
            error_reason: row.get(10)?,
            error_message: row.get(11)?,
            version: row.get(12)?,
        })
    }

    fn from_job(job: &Job) -> Result<Self, StoreError> {
        let result_json = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| storage_err("serializing result", e))?;

        Ok(Self {
            job_id: job.id.to_string(),
            state: job.state.as_str().to_string(),
            priority: job.priority,
            model_size: job.model_size.as_str().to_string(),
            input_path: job.input_ref.path.to_string_lossy().into_owned(),
            input_name: job.input_ref.file_name.clone(),
            created_at: timestamp(job.created_at),
            started_at: job.started_at.map(timestamp),
            completed_at: job.completed_at.map(timestamp),
            result_json,
            error_reason: job.error_detail.as_ref().map(|d| d.reason.as_str().to_string()),
            error_message: job.error_detail.as_ref().map(|d| d.message.clone()),
            version: job.version as i64,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let result = self
            .result_json
            .as_deref()
            .map(serde_json::from_str::<TranscriptionResult>)
            .transpose()
            .map_err(|e| storage_err("corrupt result column", e))?;

        let error_detail = match (self.error_reason, self.error_message) {
            (Some(reason), message) => Some(ErrorDetail::new(
                reason.parse().map_err(|e| storage_err("corrupt error reason", e))?,
                message.unwrap_or_default(),
            )),
            (None, _) => None,
        };

        Ok(Job {
            id: self.job_id.parse().map_err(|e| storage_err("corrupt job id", e))?,
            state: self.state.parse::<JobState>().map_err(|e| storage_err("corrupt state", e))?,
            priority: self.priority,
            model_size: self.model_size.parse().map_err(|e| storage_err("corrupt model size", e))?,
            input_ref: InputRef::new(self.input_path, self.input_name),
            created_at: parse_timestamp(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
            result,
            error_detail,
            version: self.version as u64,
        })
    }
}

fn select_one(conn: &Connection, id: JobId) -> Result<Job, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM jobs WHERE job_id = ?1");
    conn.query_row(&sql, params![id.to_string()], JobRow::read)
        .optional()
        .map_err(|e| storage_err("reading job", e))?
        .ok_or(StoreError::NotFound(id))?
        .into_job()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn create(&self, job: Job) -> Result<JobId, StoreError> {
        let id = job.id;
        let row = JobRow::from_job(&job)?;
        self.run(move |conn| {
            let sql = format!(
                "INSERT INTO jobs ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            );
            conn.execute(
                &sql,
                params![
                    row.job_id,
                    row.state,
                    row.priority,
                    row.model_size,
                    row.input_path,
                    row.input_name,
                    row.created_at,
                    row.started_at,
                    row.completed_at,
                    row.result_json,
                    row.error_reason,
                    row.error_message,
                    row.version,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref failure, _) if failure.code == ErrorCode::ConstraintViolation => {
                    StoreError::Duplicate(id)
                }
                other => storage_err("inserting job", other),
            })?;
            Ok(id)
        })
        .await
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.run(move |conn| select_one(conn, id)).await
    }

    async fn compare_and_swap(
        &self,
        id: JobId,
        expected_version: u64,
        mutator: Mutator<'_>,
    ) -> Result<CasOutcome, StoreError> {
        let current = self.get(id).await?;
        if current.version != expected_version {
            return Ok(CasOutcome::VersionMismatch(current));
        }

        let next = match next_version(&current, mutator) {
            Ok(next) => next,
            Err(reason) => return Ok(CasOutcome::Rejected { current, reason }),
        };

        let row = JobRow::from_job(&next)?;
        let expected = expected_version as i64;
        let outcome = self
            .run(move |conn| {
                let updated = conn
                    .execute(
                        "UPDATE jobs SET state = ?1, started_at = ?2, completed_at = ?3, result_json = ?4, \
                         error_reason = ?5, error_message = ?6, version = ?7 \
                         WHERE job_id = ?8 AND version = ?9",
                        params![
                            row.state,
                            row.started_at,
                            row.completed_at,
                            row.result_json,
                            row.error_reason,
                            row.error_message,
                            row.version,
                            row.job_id,
                            expected,
                        ],
                    )
                    .map_err(|e| storage_err("updating job", e))?;

                if updated == 1 {
                    Ok(None)
                } else {
                    select_one(conn, id).map(Some)
                }
            })
            .await?;

        Ok(match outcome {
            None => CasOutcome::Applied(next),
            Some(latest) => CasOutcome::VersionMismatch(latest),
        })
    }

    async fn list_in_state(&self, state: JobState) -> Result<Vec<Job>, StoreError> {
        self.run(move |conn| {
            let sql = format!("SELECT {COLUMNS} FROM jobs WHERE state = ?1 ORDER BY created_at ASC");
            let mut stmt = conn.prepare(&sql).map_err(|e| storage_err("listing jobs", e))?;
            let rows = stmt
                .query_map(params![state.as_str()], JobRow::read)
                .map_err(|e| storage_err("listing jobs", e))?;

            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row.map_err(|e| storage_err("listing jobs", e))?.into_job()?);
            }
            Ok(jobs)
        })
        .await
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = timestamp(cutoff);
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM jobs \
                 WHERE state IN ('COMPLETED', 'FAILED', 'CANCELLED') \
                 AND completed_at IS NOT NULL AND completed_at < ?1",
                params![cutoff],
            )
            .map_err(|e| storage_err("purging jobs", e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::tests::{sample_input, sample_result};
    use crate::jobs::job::Transition;
    use crate::transcription::model::ModelSize;

    fn apply(transition: Transition) -> impl Fn(&mut Job) -> Result<(), crate::jobs::job::TransitionError> + Send + Sync {
        move |job: &mut Job| job.apply(&transition, Utc::now())
    }

    #[tokio::test]
    async fn test_round_trip_through_lifecycle() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = Job::new(sample_input(), 4, ModelSize::Medium);
        let id = store.create(job.clone()).await.unwrap();

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.id, job.id);
        assert_eq!(stored.priority, 4);
        assert_eq!(stored.state, JobState::Pending);

        store.compare_and_swap(id, 1, &apply(Transition::Start)).await.unwrap();
        let outcome = store
            .compare_and_swap(id, 2, &apply(Transition::Complete(sample_result())))
            .await
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Applied(ref job) if job.version == 3));

        let done = store.get(id).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.result, Some(sample_result()));
        assert!(done.is_consistent());
    }

    #[tokio::test]
    async fn test_stale_version_is_a_mismatch() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let id = store.create(Job::new(sample_input(), 0, ModelSize::Base)).await.unwrap();
        store.compare_and_swap(id, 1, &apply(Transition::Start)).await.unwrap();

        let outcome = store.compare_and_swap(id, 1, &apply(Transition::Cancel)).await.unwrap();
        match outcome {
            CasOutcome::VersionMismatch(current) => assert_eq!(current.version, 2),
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert_eq!(store.get(id).await.unwrap().state, JobState::Processing);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = Job::new(sample_input(), 0, ModelSize::Base);
        store.create(job.clone()).await.unwrap();
        assert_eq!(store.create(job.clone()).await, Err(StoreError::Duplicate(job.id)));

        let missing = JobId::new();
        assert_eq!(store.get(missing).await, Err(StoreError::NotFound(missing)));
    }

    #[tokio::test]
    async fn test_failure_detail_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        let id = {
            let store = SqliteJobStore::open(&path).unwrap();
            let id = store.create(Job::new(sample_input(), 0, ModelSize::Tiny)).await.unwrap();
            store.compare_and_swap(id, 1, &apply(Transition::Start)).await.unwrap();
            let detail = crate::jobs::job::ErrorDetail::timeout("too slow");
            store.compare_and_swap(id, 2, &apply(Transition::Fail(detail))).await.unwrap();
            id
        };

        let reopened = SqliteJobStore::open(&path).unwrap();
        let job = reopened.get(id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_detail.unwrap().message, "too slow");
        assert_eq!(job.version, 3);
    }

    #[tokio::test]
    async fn test_list_pending_and_purge() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let first = store.create(Job::new(sample_input(), 0, ModelSize::Base)).await.unwrap();
        let second = store.create(Job::new(sample_input(), 0, ModelSize::Base)).await.unwrap();
        store.compare_and_swap(second, 1, &apply(Transition::Cancel)).await.unwrap();

        let pending = store.list_in_state(JobState::Pending).await.unwrap();
        assert_eq!(pending.iter().map(|j| j.id).collect::<Vec<_>>(), vec![first]);

        let purged = store
            .purge_terminal_before(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(second).await.is_err());
    }
}
