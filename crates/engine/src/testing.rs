//! Store doubles shared by the unit tests.

use async_trait::async_trait;
use smartq_core::{Expected, Job, JobFilter, JobId, JobLogEntry, JobStatus, JobUpdate, Time};
use smartq_storage::{InsertOutcome, MemoryStorage, Result, Storage, StorageError};

/// In-memory store with switchable write failures.
#[derive(Default)]
pub(crate) struct FaultyStorage {
    inner: MemoryStorage,
    fail_logs: bool,
    fail_outcomes: bool,
}

impl FaultyStorage {
    /// Every log append fails.
    pub(crate) fn failing_logs() -> Self {
        Self {
            fail_logs: true,
            ..Self::default()
        }
    }

    /// Every transition out of `Running` fails.
    pub(crate) fn failing_outcomes() -> Self {
        Self {
            fail_outcomes: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn insert_job(&self, job: &Job) -> Result<InsertOutcome> {
        self.inner.insert_job(job).await
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.load_job(id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.inner.list_jobs(filter).await
    }

    async fn list_pending(&self, now: Time, limit: usize) -> Result<Vec<Job>> {
        self.inner.list_pending(now, limit).await
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.inner.list_by_status(status).await
    }

    async fn dependency_states(&self, id: JobId) -> Result<Vec<(JobId, Option<JobStatus>)>> {
        self.inner.dependency_states(id).await
    }

    async fn transition(&self, id: JobId, expected: Expected, update: &JobUpdate) -> Result<bool> {
        if self.fail_outcomes && expected.status == JobStatus::Running {
            return Err(StorageError::Corrupt("jobs table locked".into()));
        }
        self.inner.transition(id, expected, update).await
    }

    async fn append_log(&self, id: JobId, message: &str, timestamp: Time) -> Result<()> {
        if self.fail_logs {
            return Err(StorageError::Corrupt("log table busy".into()));
        }
        self.inner.append_log(id, message, timestamp).await
    }

    async fn list_logs(&self, id: JobId) -> Result<Vec<JobLogEntry>> {
        self.inner.list_logs(id).await
    }
}
