//! Job service - submission, cancellation and lookup.
//!
//! Everything a caller does to the queue outside the scheduling loop goes
//! through here. Submissions are validated completely before anything is
//! written, so the engine only ever sees well-formed records.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use smartq_core::{Job, JobEvent, JobEventKind, JobFilter, JobId, JobLogEntry, JobSpec, JobStatus, JobUpdate};
use smartq_storage::{InsertOutcome, Storage};
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, Result};
use crate::notify::Notifier;

/// Result of [`JobService::submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// The persisted job (the earlier one on an idempotency hit)
    pub job: Job,
    /// Whether a new record was created
    pub created: bool,
}

/// Submission and control surface over the store.
#[derive(Clone)]
pub struct JobService {
    storage: Arc<dyn Storage>,
    capacity: BTreeMap<String, u64>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
}

impl JobService {
    /// Create a service validating requests against `capacity`.
    pub fn new(storage: Arc<dyn Storage>, capacity: BTreeMap<String, u64>) -> Self {
        Self {
            storage,
            capacity,
            notifier: Notifier::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Publish events on `notifier`.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the clock used for timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Submit a new job.
    ///
    /// A spec whose idempotency key was seen before returns the original job
    /// unchanged, even if the rest of the spec differs.
    pub async fn submit(&self, mut spec: JobSpec) -> Result<Submission> {
        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = self.storage.find_by_idempotency_key(key).await? {
                info!(job_id = %existing.id, key = %key, "Idempotency key already used");
                return Ok(Submission { job: existing, created: false });
            }
        }

        spec.job_type = spec.job_type.trim().to_string();
        let mut seen = HashSet::new();
        spec.depends_on.retain(|id| seen.insert(*id));
        self.validate(&spec).await?;

        let mut job = Job::from_spec(spec);
        job.created_at = self.clock.now();

        match self.storage.insert_job(&job).await? {
            InsertOutcome::Inserted(job) => {
                info!(job_id = %job.id, job_type = %job.job_type, priority = %job.priority, "Job created");
                let line = format!("Job created with priority {}", job.priority);
                self.notifier
                    .record(self.storage.as_ref(), JobEvent::new(job.id, JobEventKind::Created, line, job.created_at))
                    .await;
                Ok(Submission { job, created: true })
            }
            InsertOutcome::Existing(job) => Ok(Submission { job, created: false }),
        }
    }

    async fn validate(&self, spec: &JobSpec) -> Result<()> {
        if spec.job_type.is_empty() {
            return Err(EngineError::Validation("job_type must not be empty".into()));
        }

        for (dimension, quantity) in spec.resources.iter() {
            let total = self.capacity.get(dimension).copied().unwrap_or(0);
            if quantity > total {
                return Err(EngineError::Validation(format!(
                    "requests {quantity} {dimension} but capacity is {total}"
                )));
            }
        }

        if spec.timeout_seconds == Some(0) {
            return Err(EngineError::Validation("timeout_seconds must be positive".into()));
        }
        if spec.retry.max_attempts == Some(0) {
            return Err(EngineError::Validation("retry.max_attempts must be at least 1".into()));
        }
        if let Some(multiplier) = spec.retry.backoff_multiplier {
            if !(multiplier >= 1.0 && multiplier.is_finite()) {
                return Err(EngineError::Validation(format!(
                    "retry.backoff_multiplier must be a finite number >= 1, got {multiplier}"
                )));
            }
        }

        for dep in &spec.depends_on {
            if self.storage.load_job(*dep).await?.is_none() {
                return Err(EngineError::Validation(format!("dependency {dep} not found")));
            }
        }
        Ok(())
    }

    /// Cancel a job. Only legal while it is `Pending`.
    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        let now = self.clock.now();
        let update = JobUpdate::to(JobStatus::Cancelled).completed_at(now);
        if !self.storage.transition(id, JobStatus::Pending.into(), &update).await? {
            let job = self.get(id).await?;
            return Err(EngineError::InvalidState { id, status: job.status });
        }

        info!(job_id = %id, "Job cancelled");
        self.notifier
            .record(
                self.storage.as_ref(),
                JobEvent::new(id, JobEventKind::Cancelled, "Job cancelled by request", now),
            )
            .await;
        self.get(id).await
    }

    /// Look up a job.
    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.storage.load_job(id).await?.ok_or(EngineError::NotFound(id))
    }

    /// List jobs, oldest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self.storage.list_jobs(filter).await?)
    }

    /// Execution trace of a job.
    pub async fn logs(&self, id: JobId) -> Result<Vec<JobLogEntry>> {
        self.get(id).await?;
        Ok(self.storage.list_logs(id).await?)
    }
}
