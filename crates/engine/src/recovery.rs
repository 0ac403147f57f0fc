//! Startup reconciliation of jobs orphaned in `Running`.
//!
//! The ledger lives in memory only. After a restart any job still marked
//! `Running` lost its executor, so it is handed to the retry controller as a
//! failed attempt and the ledger is rebuilt from whatever is still running.

use smartq_core::{JobId, JobStatus};
use tracing::{info, warn};

use crate::engine::ExecutionEngine;
use crate::error::{ExecutionError, Result};
use crate::retry::FailureOutcome;

/// Message recorded as `last_error` on recovered jobs.
pub const ORPHANED: &str = "orphaned by restart";

/// What [`ExecutionEngine::recover`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs put back in the queue with backoff
    pub rescheduled: Vec<JobId>,
    /// Jobs that had no attempts left
    pub failed: Vec<JobId>,
    /// Jobs still `Running` after the pass, counted into the ledger
    pub still_running: usize,
}

impl RecoveryReport {
    /// Whether anything needed reconciling.
    pub fn is_empty(&self) -> bool {
        self.rescheduled.is_empty() && self.failed.is_empty() && self.still_running == 0
    }
}

impl ExecutionEngine {
    /// Reconcile orphaned `Running` jobs and rebuild ledger usage.
    ///
    /// Must run before the engine admits anything, and only when no other
    /// engine is executing against the same store.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let retry = self.retry_controller();
        let error = ExecutionError::Failed(ORPHANED.to_string());

        for job in self.storage().list_by_status(JobStatus::Running).await? {
            match retry.handle_failure(&job, &error).await? {
                FailureOutcome::Rescheduled { .. } => report.rescheduled.push(job.id),
                FailureOutcome::Failed => report.failed.push(job.id),
                FailureOutcome::LostRace => {}
            }
        }

        let running = self.storage().list_by_status(JobStatus::Running).await?;
        if !running.is_empty() {
            warn!(count = running.len(), "Jobs entered RUNNING during recovery");
        }
        self.ledger().rebuild(running.iter().map(|job| &job.resources));
        report.still_running = running.len();

        if report.is_empty() {
            info!("Recovery found nothing to reconcile");
        } else {
            info!(
                rescheduled = report.rescheduled.len(),
                failed = report.failed.len(),
                still_running = report.still_running,
                "Recovered orphaned jobs"
            );
        }
        Ok(report)
    }
}
