//! Storage trait abstraction.

use async_trait::async_trait;
use smartq_core::{Expected, Job, JobFilter, JobId, JobLogEntry, JobStatus, JobUpdate, Time};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database driver error
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Result of [`Storage::insert_job`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The job was persisted
    Inserted(Job),
    /// A job with the same idempotency key already exists; nothing was written
    Existing(Job),
}

impl InsertOutcome {
    /// The persisted job, whichever branch was taken.
    pub fn job(&self) -> &Job {
        match self {
            Self::Inserted(job) | Self::Existing(job) => job,
        }
    }

    /// Whether a new record was created.
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Job store used by the engine and the submission service.
///
/// All methods take `&self`; implementations synchronize internally so a
/// single store can be shared by several engines through an `Arc`.
#[async_trait]
pub trait Storage: Send + Sync {
    // === Submission ===

    /// Persist a new job together with its dependency edges.
    ///
    /// When the job carries an idempotency key that is already taken, the
    /// existing record is returned untouched. The check and the insert are
    /// atomic.
    async fn insert_job(&self, job: &Job) -> Result<InsertOutcome>;

    /// Load a job by ID.
    async fn load_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Look up the job submitted with `key`.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>>;

    /// List jobs matching the filter, oldest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    // === Scheduling ===

    /// Pending jobs due at `now`, ordered by priority descending then
    /// creation time ascending, at most `limit` of them.
    async fn list_pending(&self, now: Time, limit: usize) -> Result<Vec<Job>>;

    /// Every job currently in `status`.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Current state of each dependency of `id`; `None` when the
    /// dependency record no longer exists.
    async fn dependency_states(&self, id: JobId) -> Result<Vec<(JobId, Option<JobStatus>)>>;

    /// Apply `update` only if the job still matches `expected`.
    ///
    /// Returns `false` when the stored status or attempt differs (another
    /// scheduler won the race) or the job does not exist.
    async fn transition(&self, id: JobId, expected: Expected, update: &JobUpdate) -> Result<bool>;

    // === Logs ===

    /// Append one line to the job's execution trace.
    async fn append_log(&self, id: JobId, message: &str, timestamp: Time) -> Result<()>;

    /// The job's execution trace in append order.
    async fn list_logs(&self, id: JobId) -> Result<Vec<JobLogEntry>>;
}

/// Priority-then-age ordering shared by the backends.
pub(crate) fn candidate_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}
