//! Job model - the unit of schedulable work.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::Time;

/// Compute units dimension.
pub const CPU_UNITS: &str = "cpu_units";

/// Memory dimension, in megabytes.
pub const MEMORY_MB: &str = "memory_mb";

/// Priority tier of a job. Ordered so that `Critical` is the greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work
    Low,
    /// Default tier
    #[default]
    Normal,
    /// Ahead of normal work
    High,
    /// Always considered first
    Critical,
}

impl Priority {
    /// Numeric rank used for ordering in SQL (higher runs first).
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.pad(s)
    }
}

/// Error returned when parsing a [`Priority`] or [`JobStatus`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(ParseEnumError { kind: "priority", value: s.to_string() }),
        }
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// PENDING → RUNNING → SUCCESS | FAILED | PENDING (retry)
/// PENDING → CANCELLED
/// ```
///
/// `Blocked` is never written by the engine: readiness is recomputed from
/// `Pending` on every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be selected
    Pending,
    /// Admitted and executing
    Running,
    /// Finished without error
    Success,
    /// Gave up after exhausting its attempts
    Failed,
    /// Cancelled before admission
    Cancelled,
    /// Waiting on dependencies (not materialized by the engine)
    Blocked,
}

impl JobStatus {
    /// All states, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Blocked,
    ];

    /// Whether no further transition can leave this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError { kind: "job status", value: s.to_string() })
    }
}

/// Resource request of a job: dimension name to quantity.
///
/// Dimensions that are not listed are requested at zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRequirements(BTreeMap<String, u64>);

impl ResourceRequirements {
    /// Empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `quantity` of `dimension`.
    pub fn with(mut self, dimension: impl Into<String>, quantity: u64) -> Self {
        self.0.insert(dimension.into(), quantity);
        self
    }

    /// Shorthand for the two well-known dimensions.
    pub fn cpu_mem(cpu_units: u64, memory_mb: u64) -> Self {
        Self::new().with(CPU_UNITS, cpu_units).with(MEMORY_MB, memory_mb)
    }

    /// Requested quantity of `dimension` (zero when absent).
    pub fn get(&self, dimension: &str) -> u64 {
        self.0.get(dimension).copied().unwrap_or(0)
    }

    /// Iterate over the explicitly requested dimensions.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Whether nothing is requested.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|q| *q == 0)
    }
}

impl FromIterator<(String, u64)> for ResourceRequirements {
    fn from_iter<T: IntoIterator<Item = (String, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-job retry configuration. Unset fields fall back to engine defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts allowed (first run included)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Growth factor applied to the retry delay after each failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

impl RetryConfig {
    /// Retry up to `max_attempts` times with the given multiplier.
    pub fn new(max_attempts: u32, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff_multiplier: Some(backoff_multiplier),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub id: JobId,

    /// Free-form type tag, opaque to the engine
    pub job_type: String,

    /// Priority tier
    pub priority: Priority,

    /// Current state
    pub status: JobStatus,

    /// Opaque payload handed to the job body
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Resources reserved while the job runs
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Execution deadline in seconds
    pub timeout_seconds: Option<u64>,

    /// Jobs that must reach `Success` before this one may run
    #[serde(default)]
    pub depends_on: Vec<JobId>,

    /// Caller-supplied deduplication key
    pub idempotency_key: Option<String>,

    /// Message of the most recent failure
    pub last_error: Option<String>,

    /// Number of execution attempts started so far
    pub current_attempt: u32,

    /// Not eligible for selection before this instant
    pub run_at: Option<Time>,

    /// Creation timestamp
    pub created_at: Time,

    /// Start of the most recent attempt
    pub started_at: Option<Time>,

    /// End of the most recent attempt
    pub completed_at: Option<Time>,
}

impl Job {
    /// Build a fresh `Pending` record from a submission.
    pub fn from_spec(spec: JobSpec) -> Self {
        Self {
            id: JobId::new(),
            job_type: spec.job_type,
            priority: spec.priority,
            status: JobStatus::Pending,
            payload: spec.payload,
            resources: spec.resources,
            retry: spec.retry,
            timeout_seconds: spec.timeout_seconds,
            depends_on: spec.depends_on,
            idempotency_key: spec.idempotency_key,
            last_error: None,
            current_attempt: 0,
            run_at: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the job may be selected at `now`.
    pub fn is_due(&self, now: Time) -> bool {
        self.run_at.map_or(true, |at| at <= now)
    }

    /// Apply the fields carried by a state transition.
    pub fn apply(&mut self, update: &JobUpdate) {
        self.status = update.status;
        if let Some(at) = update.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = update.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(attempt) = update.current_attempt {
            self.current_attempt = attempt;
        }
        if let Some(run_at) = update.run_at {
            self.run_at = run_at;
        }
        if let Some(error) = &update.last_error {
            self.last_error = Some(error.clone());
        }
    }
}

/// Submission input for a new job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Free-form type tag
    pub job_type: String,
    /// Priority tier
    #[serde(default)]
    pub priority: Priority,
    /// Opaque payload
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Resource request
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Dependencies by id
    #[serde(default)]
    pub depends_on: Vec<JobId>,
    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
    /// Execution deadline in seconds
    pub timeout_seconds: Option<u64>,
    /// Caller-supplied deduplication key
    pub idempotency_key: Option<String>,
}

impl JobSpec {
    /// A spec with the given type and defaults everywhere else.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the resource request.
    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    /// Add a dependency.
    pub fn depends_on(mut self, id: JobId) -> Self {
        self.depends_on.push(id);
        self
    }

    /// Set the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the execution deadline.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Set the idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Precondition of a conditional state transition.
///
/// A copy of a job read before another writer bumped its attempt counter
/// matches on status alone, so admission and outcome writes also pin the
/// attempt they were computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    /// State the job must still be in
    pub status: JobStatus,
    /// Attempt counter the job must still be at, when set
    pub attempt: Option<u32>,
}

impl Expected {
    /// Match on `status` and `attempt`.
    pub fn at_attempt(status: JobStatus, attempt: u32) -> Self {
        Self {
            status,
            attempt: Some(attempt),
        }
    }

    /// Whether `job` satisfies the precondition.
    pub fn matches(&self, job: &Job) -> bool {
        job.status == self.status && self.attempt.map_or(true, |a| a == job.current_attempt)
    }
}

impl From<JobStatus> for Expected {
    fn from(status: JobStatus) -> Self {
        Self { status, attempt: None }
    }
}

/// Fields written together with a conditional state transition.
///
/// `None` leaves the stored value untouched; `run_at: Some(None)` clears it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    /// New state
    pub status: JobStatus,
    /// Start of the attempt
    pub started_at: Option<Time>,
    /// End of the attempt
    pub completed_at: Option<Time>,
    /// Attempt counter
    pub current_attempt: Option<u32>,
    /// Next eligible instant
    pub run_at: Option<Option<Time>>,
    /// Failure message
    pub last_error: Option<String>,
}

impl JobUpdate {
    /// Transition to `status` without touching any other field.
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            started_at: None,
            completed_at: None,
            current_attempt: None,
            run_at: None,
            last_error: None,
        }
    }

    /// Admission: `Running`, stamped and with the attempt counter bumped.
    pub fn running(started_at: Time, attempt: u32) -> Self {
        Self {
            started_at: Some(started_at),
            current_attempt: Some(attempt),
            run_at: Some(None),
            ..Self::to(JobStatus::Running)
        }
    }

    /// Record the completion time.
    pub fn completed_at(mut self, at: Time) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// Record a failure message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Delay the next selection until `at`.
    pub fn run_at(mut self, at: Time) -> Self {
        self.run_at = Some(Some(at));
        self
    }
}

/// One line of a job's execution trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLogEntry {
    /// When the line was written
    pub timestamp: Time,
    /// Free-text message
    pub message: String,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only these states (all states when `None`)
    pub statuses: Option<Vec<JobStatus>>,
    /// Maximum number of jobs returned
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Whether `job` passes the status filter.
    pub fn matches(&self, job: &Job) -> bool {
        self.statuses
            .as_ref()
            .map_or(true, |statuses| statuses.contains(&job.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn priority_orders_critical_highest() {
        let mut tiers = vec![Priority::Normal, Priority::Critical, Priority::Low, Priority::High];
        tiers.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            tiers,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
        assert!(Priority::Critical.rank() > Priority::Low.rank());
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("PENDING".parse::<JobStatus>().unwrap(), JobStatus::Pending);
        assert_eq!("cancelled".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        assert!("done".parse::<JobStatus>().is_err());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn expected_pins_attempt_when_set() {
        let mut job = Job::from_spec(JobSpec::new("t"));
        job.current_attempt = 1;

        assert!(Expected::from(JobStatus::Pending).matches(&job));
        assert!(Expected::at_attempt(JobStatus::Pending, 1).matches(&job));
        assert!(!Expected::at_attempt(JobStatus::Pending, 0).matches(&job));
        assert!(!Expected::at_attempt(JobStatus::Running, 1).matches(&job));
    }

    #[test]
    fn missing_dimension_reads_as_zero() {
        let req = ResourceRequirements::cpu_mem(4, 2048);
        assert_eq!(req.get(CPU_UNITS), 4);
        assert_eq!(req.get("gpu"), 0);
        assert!(!req.is_empty());
        assert!(ResourceRequirements::new().with("gpu", 0).is_empty());
    }

    #[test]
    fn spec_deserializes_submission_json() {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "job_type": "heavy_processing",
            "priority": "high",
            "payload": {"batch_number": 1},
            "resources": {"cpu_units": 4, "memory_mb": 2048},
            "retry": {"max_attempts": 3, "backoff_multiplier": 2},
            "timeout_seconds": 10
        }))
        .unwrap();
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.resources, ResourceRequirements::cpu_mem(4, 2048));
        assert_eq!(spec.retry, RetryConfig::new(3, 2.0));
        assert_eq!(spec.timeout_seconds, Some(10));
    }

    #[test]
    fn update_applies_only_carried_fields() {
        let mut job = Job::from_spec(JobSpec::new("t"));
        job.run_at = Some(Utc::now() - Duration::seconds(1));
        let start = Utc::now();

        job.apply(&JobUpdate::running(start, 1));
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.started_at, Some(start));
        assert_eq!(job.current_attempt, 1);
        assert_eq!(job.run_at, None);
        assert_eq!(job.last_error, None);

        let later = start + Duration::seconds(5);
        job.apply(&JobUpdate::to(JobStatus::Pending).with_error("boom").run_at(later));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.run_at, Some(later));
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert_eq!(job.current_attempt, 1);
        assert!(!job.is_due(start));
        assert!(job.is_due(later));
    }

    #[test]
    fn filter_matches_statuses() {
        let job = Job::from_spec(JobSpec::new("t"));
        assert!(JobFilter::default().matches(&job));
        let only_running = JobFilter {
            statuses: Some(vec![JobStatus::Running]),
            limit: None,
        };
        assert!(!only_running.matches(&job));
    }
}
