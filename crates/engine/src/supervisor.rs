//! Execution supervisor - runs one admitted job under a deadline.

use std::sync::Arc;
use std::time::Duration;

use smartq_core::{Expected, Job, JobEvent, JobEventKind, JobStatus, JobUpdate, Time};
use smartq_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::body::JobBody;
use crate::clock::Clock;
use crate::error::{ExecutionError, Result};
use crate::ledger::Reservation;
use crate::notify::Notifier;
use crate::retry::{FailureOutcome, RetryController};
use crate::selector::Admission;

/// Final result of supervising one admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    /// The job reached `Success`
    Succeeded,
    /// The attempt failed and the job is `Pending` again
    Rescheduled {
        /// Next eligible instant
        run_at: Time,
    },
    /// The attempt failed and no attempts remain
    Failed,
    /// Another scheduler changed the job first; nothing was executed or recorded
    LostRace,
}

impl From<FailureOutcome> for RunOutcome {
    fn from(outcome: FailureOutcome) -> Self {
        match outcome {
            FailureOutcome::Rescheduled { run_at } => RunOutcome::Rescheduled { run_at },
            FailureOutcome::Failed => RunOutcome::Failed,
            FailureOutcome::LostRace => RunOutcome::LostRace,
        }
    }
}

/// A job this scheduler moved to `Running`, still holding its reservation.
///
/// Produced by [`Supervisor::claim`] and consumed by [`Supervisor::drive`].
#[derive(Debug)]
pub struct Claim {
    job: Job,
    reservation: Reservation,
}

impl Claim {
    /// The claimed job as written by the claim.
    pub fn job(&self) -> &Job {
        &self.job
    }
}

/// Drives one job through `Running` to its outcome.
#[derive(Clone)]
pub struct Supervisor {
    storage: Arc<dyn Storage>,
    body: Arc<dyn JobBody>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    retry: RetryController,
    default_timeout: Duration,
    cancel_grace: Duration,
}

impl Supervisor {
    /// Create a supervisor.
    pub fn new(
        storage: Arc<dyn Storage>,
        body: Arc<dyn JobBody>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        retry: RetryController,
    ) -> Self {
        Self {
            storage,
            body,
            notifier,
            clock,
            retry,
            default_timeout: Duration::from_secs(300),
            cancel_grace: Duration::from_secs(5),
        }
    }

    /// Deadline for jobs without `timeout_seconds`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Time a timed-out body gets to observe cancellation.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Claim and execute an admitted job.
    pub async fn run(&self, admission: Admission) -> Result<RunOutcome> {
        match self.claim(admission).await? {
            Some(claim) => self.drive(claim).await,
            None => Ok(RunOutcome::LostRace),
        }
    }

    /// Move an admitted job from `Pending` to `Running`.
    ///
    /// The write is pinned to the attempt the selector saw, so a stale copy
    /// of a job that has since been retried never wins. Returns `None`, with
    /// the reservation released, when another writer got there first.
    pub async fn claim(&self, admission: Admission) -> Result<Option<Claim>> {
        let Admission { mut job, reservation } = admission;

        let started_at = self.clock.now();
        let attempt = job.current_attempt + 1;
        let start = JobUpdate::running(started_at, attempt);
        let expected = Expected::at_attempt(JobStatus::Pending, job.current_attempt);
        if !self.storage.transition(job.id, expected, &start).await? {
            warn!(job_id = %job.id, "Lost race admitting job");
            reservation.release();
            return Ok(None);
        }
        job.apply(&start);

        let max_attempts = self.retry.policy().max_attempts(&job);
        info!(job_id = %job.id, job_type = %job.job_type, attempt, "Job started");
        let line = format!("Attempt {attempt}/{max_attempts} started");
        self.notifier
            .record(self.storage.as_ref(), JobEvent::new(job.id, JobEventKind::Started, line, started_at))
            .await;

        Ok(Some(Claim { job, reservation }))
    }

    /// Execute a claimed job under its deadline and record the outcome.
    ///
    /// The reservation is released before the outcome is written, on every
    /// path.
    pub async fn drive(&self, claim: Claim) -> Result<RunOutcome> {
        let Claim { job, reservation } = claim;

        let timeout = job.timeout_seconds.map_or(self.default_timeout, Duration::from_secs);
        let result = self.execute(&job, timeout).await;
        reservation.release();

        match result {
            Ok(()) => self.succeed(&job).await,
            Err(error) => Ok(self.retry.handle_failure(&job, &error).await?.into()),
        }
    }

    async fn execute(&self, job: &Job, timeout: Duration) -> std::result::Result<(), ExecutionError> {
        let cancel = CancellationToken::new();
        let mut body = self.body.execute(job, cancel.clone());

        tokio::select! {
            result = &mut body => result,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                if tokio::time::timeout(self.cancel_grace, &mut body).await.is_err() {
                    warn!(job_id = %job.id, grace = ?self.cancel_grace, "Body ignored cancellation, abandoning it");
                }
                Err(ExecutionError::Timeout { seconds: timeout.as_secs() })
            }
        }
    }

    async fn succeed(&self, job: &Job) -> Result<RunOutcome> {
        let now = self.clock.now();
        let update = JobUpdate::to(JobStatus::Success).completed_at(now);
        let expected = Expected::at_attempt(JobStatus::Running, job.current_attempt);
        if !self.storage.transition(job.id, expected, &update).await? {
            warn!(job_id = %job.id, "Job left RUNNING before its success was recorded");
            return Ok(RunOutcome::LostRace);
        }

        info!(job_id = %job.id, attempt = job.current_attempt, "Job succeeded");
        let line = format!("Attempt {} succeeded", job.current_attempt);
        self.notifier
            .record(self.storage.as_ref(), JobEvent::new(job.id, JobEventKind::Succeeded, line, now))
            .await;
        Ok(RunOutcome::Succeeded)
    }
}
