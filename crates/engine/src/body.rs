//! Job bodies - the work an admitted job performs.

use std::time::Duration;

use async_trait::async_trait;
use smartq_core::Job;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ExecutionError;

/// Executes the work of one job attempt.
///
/// Bodies must watch `cancel` and return promptly once it fires; a body
/// still running after the grace period is dropped at its next await point.
#[async_trait]
pub trait JobBody: Send + Sync {
    /// Run the job to completion.
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> Result<(), ExecutionError>;
}

/// Opaque simulated work.
///
/// Sleeps for a fixed duration. Two payload keys steer it:
/// - `should_fail` (bool): fail immediately
/// - `duration_seconds` (number): sleep this long instead of the default
#[derive(Debug, Clone)]
pub struct SimulatedWork {
    default_duration: Duration,
}

impl SimulatedWork {
    /// Simulated work lasting `default_duration` unless the payload says otherwise.
    pub fn new(default_duration: Duration) -> Self {
        Self { default_duration }
    }

    fn duration_for(&self, job: &Job) -> Duration {
        job.payload
            .get("duration_seconds")
            .and_then(serde_json::Value::as_f64)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(self.default_duration)
    }
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl JobBody for SimulatedWork {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> Result<(), ExecutionError> {
        let should_fail = job
            .payload
            .get("should_fail")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if should_fail {
            return Err(ExecutionError::Failed("simulated failure".to_string()));
        }

        let duration = self.duration_for(job);
        debug!(job_id = %job.id, ?duration, "Simulating work");
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use smartq_core::JobSpec;

    fn within(elapsed: Duration, expected: Duration) -> bool {
        elapsed >= expected && elapsed < expected + Duration::from_millis(10)
    }

    fn job(payload: serde_json::Value) -> Job {
        Job::from_spec(JobSpec::new("sim").with_payload(payload))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_for_payload_duration() {
        let body = SimulatedWork::default();
        let start = tokio::time::Instant::now();
        body.execute(&job(json!({"duration_seconds": 2.5})), CancellationToken::new())
            .await
            .unwrap();
        assert!(within(start.elapsed(), Duration::from_millis(2500)));

        let start = tokio::time::Instant::now();
        body.execute(&job(json!({})), CancellationToken::new()).await.unwrap();
        assert!(within(start.elapsed(), Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_fail_hook() {
        let body = SimulatedWork::default();
        let result = body
            .execute(&job(json!({"should_fail": true})), CancellationToken::new())
            .await;
        assert_eq!(result, Err(ExecutionError::Failed("simulated failure".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observes_cancellation() {
        let body = SimulatedWork::default();
        let token = CancellationToken::new();
        token.cancel();
        let result = body.execute(&job(json!({"duration_seconds": 60})), token).await;
        assert_eq!(result, Err(ExecutionError::Cancelled));
    }
}
