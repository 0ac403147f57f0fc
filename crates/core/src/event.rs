//! Status-change events broadcast to subscribers.

use crate::id::JobId;
use crate::Time;
use serde::{Deserialize, Serialize};

/// Kind of transition an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// Accepted by the submission service
    Created,
    /// Admitted and executing
    Started,
    /// Finished without error
    Succeeded,
    /// Terminally failed
    Failed,
    /// Cancelled while pending
    Cancelled,
    /// Failed attempt, scheduled for retry
    Rescheduled,
}

/// A human-readable notification about one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Subject of the event
    pub job_id: JobId,

    /// What happened
    pub kind: JobEventKind,

    /// Text shown to subscribers
    pub message: String,

    /// When it happened
    pub timestamp: Time,
}

impl JobEvent {
    /// Create an event that happened at `timestamp`.
    pub fn new(job_id: JobId, kind: JobEventKind, message: impl Into<String>, timestamp: Time) -> Self {
        Self {
            job_id,
            kind,
            message: message.into(),
            timestamp,
        }
    }
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.job_id, self.message)
    }
}
