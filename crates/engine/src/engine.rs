//! The main execution engine - runs the scheduling loop.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use smartq_core::{DependencyFailurePolicy, JobEvent, JobEventKind, JobId, JobStatus, JobUpdate, SchedulerConfig};
use smartq_storage::Storage;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::body::{JobBody, SimulatedWork};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ledger::ResourceLedger;
use crate::notify::Notifier;
use crate::retry::{RetryController, RetryPolicy};
use crate::selector::{CandidateSelector, PrioritySelector, Selection};
use crate::supervisor::{Claim, RunOutcome, Supervisor};

/// Configuration for the execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Idle sleep between selection passes
    pub tick_interval: Duration,
    /// Candidates considered per pass
    pub scan_limit: usize,
    /// Execution slots used by [`ExecutionEngine::run`]
    pub max_concurrent: NonZeroUsize,
    /// Deadline for jobs without `timeout_seconds`
    pub default_timeout: Duration,
    /// Time a timed-out body gets to observe cancellation
    pub cancel_grace: Duration,
    /// Backoff parameters
    pub retry: RetryPolicy,
    /// Handling of permanently failed dependencies
    pub dependency_failure: DependencyFailurePolicy,
    /// Max jobs dispatched before stopping (None = infinite)
    pub max_cycles: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for EngineConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(config.tick_interval_secs),
            scan_limit: config.scan_limit,
            max_concurrent: NonZeroUsize::new(config.max_concurrent).unwrap_or(NonZeroUsize::MIN),
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            cancel_grace: Duration::from_secs(config.cancel_grace_secs),
            retry: RetryPolicy::from(config),
            dependency_failure: config.dependency_failure,
            max_cycles: None,
        }
    }
}

impl EngineConfig {
    /// Set the number of execution slots.
    pub fn with_max_concurrent(mut self, max: NonZeroUsize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Stop after dispatching `cycles` jobs.
    pub fn with_max_cycles(mut self, cycles: usize) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    /// Set the dependency failure policy.
    pub fn with_dependency_failure(mut self, policy: DependencyFailurePolicy) -> Self {
        self.dependency_failure = policy;
        self
    }
}

/// Result of a single execution cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleResult {
    /// A job was executed to an outcome
    Executed {
        /// The job that ran
        job_id: JobId,
        /// How its attempt ended
        outcome: RunOutcome,
    },
    /// Nothing was runnable
    Idle,
}

/// What one dispatch pass of [`ExecutionEngine::run`] achieved.
enum Dispatch {
    Claimed(Claim),
    LostRace,
    Idle,
}

/// The main execution engine.
///
/// Runs the scheduling loop:
/// ```text
/// Select (reserve) → Mark RUNNING → Execute under deadline → Release → Record
/// ```
///
/// Several engines may share one store and one ledger.
pub struct ExecutionEngine {
    storage: Arc<dyn Storage>,
    ledger: Arc<ResourceLedger>,
    selector: Arc<dyn CandidateSelector>,
    body: Arc<dyn JobBody>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    cycles_run: AtomicUsize,
}

impl ExecutionEngine {
    /// Create a new execution engine.
    pub fn new(storage: Arc<dyn Storage>, ledger: Arc<ResourceLedger>, config: EngineConfig) -> Self {
        Self {
            storage,
            ledger,
            selector: Arc::new(PrioritySelector::new(config.scan_limit)),
            body: Arc::new(SimulatedWork::default()),
            notifier: Notifier::default(),
            clock: Arc::new(SystemClock),
            config,
            cycles_run: AtomicUsize::new(0),
        }
    }

    /// Set the candidate selector.
    pub fn with_selector(mut self, selector: Arc<dyn CandidateSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Set the job body.
    pub fn with_body(mut self, body: Arc<dyn JobBody>) -> Self {
        self.body = body;
        self
    }

    /// Publish status events on `notifier`.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn retry_controller(&self) -> RetryController {
        RetryController::new(
            Arc::clone(&self.storage),
            self.notifier.clone(),
            Arc::clone(&self.clock),
            self.config.retry,
        )
    }

    fn supervisor(&self) -> Supervisor {
        Supervisor::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.body),
            self.notifier.clone(),
            Arc::clone(&self.clock),
            self.retry_controller(),
        )
        .with_default_timeout(self.config.default_timeout)
        .with_cancel_grace(self.config.cancel_grace)
    }

    async fn select(&self) -> Result<Selection> {
        let selection = self
            .selector
            .select_next(self.storage.as_ref(), &self.ledger, self.clock.now())
            .await?;
        if self.config.dependency_failure == DependencyFailurePolicy::Cancel {
            for (id, deps) in &selection.unsatisfiable {
                self.cancel_orphan(*id, deps).await?;
            }
        }
        Ok(selection)
    }

    async fn cancel_orphan(&self, id: JobId, deps: &[JobId]) -> Result<()> {
        let now = self.clock.now();
        let listed = deps.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        let reason = format!("Dependency can no longer succeed: {listed}");
        let update = JobUpdate::to(JobStatus::Cancelled)
            .completed_at(now)
            .with_error(&reason);
        if !self.storage.transition(id, JobStatus::Pending.into(), &update).await? {
            return Ok(());
        }

        info!(job_id = %id, deps = %listed, "Cancelled job with failed dependencies");
        self.notifier
            .record(self.storage.as_ref(), JobEvent::new(id, JobEventKind::Cancelled, reason, now))
            .await;
        Ok(())
    }

    /// Run one execution cycle: select a job and run it to its outcome.
    ///
    /// Lost races are skipped silently and the scan is retried.
    pub async fn run_cycle(&self) -> Result<CycleResult> {
        loop {
            let Some(admission) = self.select().await?.admission else {
                debug!("No jobs are ready to run");
                return Ok(CycleResult::Idle);
            };

            let job_id = admission.job.id;
            let outcome = self.supervisor().run(admission).await?;
            if outcome == RunOutcome::LostRace {
                continue;
            }

            let cycle = self.cycles_run.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(cycle, job_id = %job_id, ?outcome, "Cycle finished");
            return Ok(CycleResult::Executed { job_id, outcome });
        }
    }

    /// Run the engine until `shutdown` fires (or `max_cycles` jobs were
    /// dispatched), keeping up to `max_concurrent` jobs in flight.
    ///
    /// Jobs are claimed (`Pending` to `Running`) here, before their task is
    /// spawned, so the next selection pass can never pick the same job again.
    /// On shutdown no further jobs are admitted and in-flight jobs are
    /// awaited.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let slots = Arc::new(Semaphore::new(self.config.max_concurrent.get()));
        let mut running: JoinSet<(JobId, Result<RunOutcome>)> = JoinSet::new();
        let mut dispatched = 0usize;

        info!(
            max_concurrent = self.config.max_concurrent.get(),
            tick = ?self.config.tick_interval,
            "Engine started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if let Some(max) = self.config.max_cycles {
                if dispatched >= max {
                    info!("Reached max cycles ({})", max);
                    break;
                }
            }

            let mut rescan = false;
            if let Ok(permit) = Arc::clone(&slots).try_acquire_owned() {
                match self.dispatch().await {
                    Ok(Dispatch::Claimed(claim)) => {
                        let supervisor = self.supervisor();
                        let job_id = claim.job().id;
                        dispatched += 1;
                        rescan = true;
                        running.spawn(async move {
                            let outcome = supervisor.drive(claim).await;
                            drop(permit);
                            (job_id, outcome)
                        });
                    }
                    Ok(Dispatch::LostRace) => rescan = true,
                    Ok(Dispatch::Idle) => debug!("No jobs are ready to run"),
                    Err(e) => error!(error = %e, "Selection failed"),
                }
            }

            // Keep filling free slots before sleeping
            if rescan {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => self.finished(joined),
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }

        info!(in_flight = running.len(), "Engine stopping, draining in-flight jobs");
        while let Some(joined) = running.join_next().await {
            self.finished(joined);
        }
        info!("Engine stopped");
        Ok(())
    }

    async fn dispatch(&self) -> Result<Dispatch> {
        let Some(admission) = self.select().await?.admission else {
            return Ok(Dispatch::Idle);
        };
        Ok(match self.supervisor().claim(admission).await? {
            Some(claim) => Dispatch::Claimed(claim),
            None => Dispatch::LostRace,
        })
    }

    fn finished(&self, joined: std::result::Result<(JobId, Result<RunOutcome>), tokio::task::JoinError>) {
        match joined {
            Ok((job_id, Ok(outcome))) => {
                if outcome != RunOutcome::LostRace {
                    self.cycles_run.fetch_add(1, Ordering::Relaxed);
                }
                debug!(job_id = %job_id, ?outcome, "Job finished");
            }
            Ok((job_id, Err(e))) => error!(job_id = %job_id, error = %e, "Job supervision failed"),
            Err(e) => warn!(error = %e, "Job task aborted"),
        }
    }

    /// Get cycles run so far.
    pub fn cycles(&self) -> usize {
        self.cycles_run.load(Ordering::Relaxed)
    }

    /// Get a reference to the storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Get a reference to the ledger.
    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// The notifier events are published on.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
