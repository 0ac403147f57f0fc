//! Failure handling and exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use smartq_core::{Expected, Job, JobEvent, JobEventKind, JobStatus, JobUpdate, SchedulerConfig, Time};
use smartq_storage::Storage;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{ExecutionError, Result};
use crate::notify::Notifier;

/// Backoff parameters and per-job defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Attempts allowed when the job does not say
    pub default_max_attempts: u32,
    /// Growth factor when the job does not say
    pub default_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(3600),
            default_max_attempts: 1,
            default_multiplier: 2.0,
        }
    }
}

impl From<&SchedulerConfig> for RetryPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_retry_delay_secs),
            max_delay: Duration::from_secs(config.max_retry_delay_secs),
            default_max_attempts: config.default_max_attempts,
            default_multiplier: config.default_backoff_multiplier,
        }
    }
}

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Put it back in the queue, not eligible before `run_at`
    Retry {
        /// Backoff applied
        delay: Duration,
        /// Next eligible instant
        run_at: Time,
    },
    /// Attempts exhausted
    GiveUp,
}

impl RetryPolicy {
    /// Total attempts allowed for `job`.
    pub fn max_attempts(&self, job: &Job) -> u32 {
        job.retry.max_attempts.unwrap_or(self.default_max_attempts).max(1)
    }

    /// Backoff multiplier for `job`.
    pub fn multiplier(&self, job: &Job) -> f64 {
        job.retry.backoff_multiplier.unwrap_or(self.default_multiplier)
    }

    /// Delay after the `attempt`-th failure: `base * multiplier^(attempt - 1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, multiplier: f64) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Decide between retrying and failing `job` at `now`.
    pub fn decide(&self, job: &Job, now: Time) -> RetryDecision {
        if job.current_attempt >= self.max_attempts(job) {
            return RetryDecision::GiveUp;
        }
        let delay = self.delay_for(job.current_attempt, self.multiplier(job));
        let run_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
        RetryDecision::Retry { delay, run_at }
    }
}

/// Result of [`RetryController::handle_failure`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureOutcome {
    /// Back to `Pending`, eligible at `run_at`
    Rescheduled {
        /// Next eligible instant
        run_at: Time,
    },
    /// Terminally `Failed`
    Failed,
    /// The job was no longer `Running`; nothing written
    LostRace,
}

/// Moves failed `Running` jobs back to `Pending` or to `Failed`.
#[derive(Clone)]
pub struct RetryController {
    storage: Arc<dyn Storage>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl RetryController {
    /// Create a controller writing to `storage`.
    pub fn new(storage: Arc<dyn Storage>, notifier: Notifier, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            storage,
            notifier,
            clock,
            policy,
        }
    }

    /// The backoff parameters in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed attempt of `job`, which must still be `Running` the
    /// attempt it was read at.
    pub async fn handle_failure(&self, job: &Job, error: &ExecutionError) -> Result<FailureOutcome> {
        let now = self.clock.now();
        let max_attempts = self.policy.max_attempts(job);
        let message = error.to_string();
        let expected = Expected::at_attempt(JobStatus::Running, job.current_attempt);

        match self.policy.decide(job, now) {
            RetryDecision::Retry { delay, run_at } => {
                let update = JobUpdate::to(JobStatus::Pending)
                    .completed_at(now)
                    .with_error(&message)
                    .run_at(run_at);
                if !self.storage.transition(job.id, expected, &update).await? {
                    warn!(job_id = %job.id, "Job left RUNNING before its failure was recorded");
                    return Ok(FailureOutcome::LostRace);
                }

                let line = format!(
                    "Attempt {}/{} failed: {message}. Retrying in {:.1}s",
                    job.current_attempt,
                    max_attempts,
                    delay.as_secs_f64()
                );
                info!(job_id = %job.id, attempt = job.current_attempt, ?delay, error = %message, "Job rescheduled");
                self.notifier
                    .record(self.storage.as_ref(), JobEvent::new(job.id, JobEventKind::Rescheduled, line, now))
                    .await;
                Ok(FailureOutcome::Rescheduled { run_at })
            }
            RetryDecision::GiveUp => {
                let update = JobUpdate::to(JobStatus::Failed)
                    .completed_at(now)
                    .with_error(&message);
                if !self.storage.transition(job.id, expected, &update).await? {
                    warn!(job_id = %job.id, "Job left RUNNING before its failure was recorded");
                    return Ok(FailureOutcome::LostRace);
                }

                let line = format!(
                    "Attempt {}/{} failed: {message}. Giving up",
                    job.current_attempt, max_attempts
                );
                info!(job_id = %job.id, attempt = job.current_attempt, error = %message, "Job failed");
                self.notifier
                    .record(self.storage.as_ref(), JobEvent::new(job.id, JobEventKind::Failed, line, now))
                    .await;
                Ok(FailureOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use smartq_core::{JobSpec, RetryConfig};
    use smartq_storage::MemoryStorage;

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..=4).map(|a| policy.delay_for(a, 2.0).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(10, 2.0), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX, 10.0), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3, 1.0), Duration::from_secs(5));
    }

    #[test]
    fn test_decide_respects_max_attempts() {
        let policy = RetryPolicy::default();
        let now = chrono::Utc::now();
        let mut job = Job::from_spec(JobSpec::new("t").with_retry(RetryConfig::new(3, 2.0)));

        job.current_attempt = 2;
        match policy.decide(&job, now) {
            RetryDecision::Retry { delay, run_at } => {
                assert_eq!(delay, Duration::from_secs(10));
                assert_eq!(run_at - now, chrono::Duration::seconds(10));
            }
            RetryDecision::GiveUp => panic!("attempt 2 of 3 should retry"),
        }

        job.current_attempt = 3;
        assert_eq!(policy.decide(&job, now), RetryDecision::GiveUp);

        // Unset max_attempts falls back to a single attempt
        let mut single = Job::from_spec(JobSpec::new("t"));
        single.current_attempt = 1;
        assert_eq!(policy.decide(&single, now), RetryDecision::GiveUp);
    }

    #[tokio::test]
    async fn test_handle_failure_writes_state_and_log() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let notifier = Notifier::default();
        let mut events = notifier.subscribe();
        let controller = RetryController::new(
            Arc::clone(&storage),
            notifier,
            Arc::new(SystemClock),
            RetryPolicy::default(),
        );

        let mut job = Job::from_spec(JobSpec::new("flaky").with_retry(RetryConfig::new(2, 2.0)));
        storage.insert_job(&job).await.unwrap();
        let start = JobUpdate::running(chrono::Utc::now(), 1);
        assert!(storage.transition(job.id, JobStatus::Pending.into(), &start).await.unwrap());
        job.apply(&start);

        let error = ExecutionError::Failed("boom".into());
        let outcome = controller.handle_failure(&job, &error).await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Rescheduled { .. }));

        let stored = storage.load_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(stored.run_at.is_some());
        assert_eq!(events.recv().await.unwrap().kind, JobEventKind::Rescheduled);

        // Not running any more, so a second report is a lost race
        assert_eq!(
            controller.handle_failure(&job, &error).await.unwrap(),
            FailureOutcome::LostRace
        );
        assert_eq!(storage.list_logs(job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_outcome_for_other_attempt_is_a_lost_race() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let controller = RetryController::new(
            Arc::clone(&storage),
            Notifier::default(),
            Arc::new(SystemClock),
            RetryPolicy::default(),
        );

        let mut job = Job::from_spec(JobSpec::new("flaky").with_retry(RetryConfig::new(3, 2.0)));
        storage.insert_job(&job).await.unwrap();
        let start = JobUpdate::running(chrono::Utc::now(), 2);
        assert!(storage.transition(job.id, JobStatus::Pending.into(), &start).await.unwrap());

        // A copy still at attempt 1 must not overwrite attempt 2
        job.status = JobStatus::Running;
        job.current_attempt = 1;
        let outcome = controller
            .handle_failure(&job, &ExecutionError::Failed("late".into()))
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::LostRace);

        let stored = storage.load_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.current_attempt, 2);
        assert!(stored.last_error.is_none());
    }
}
