//! smartq core data models.
//!
//! This crate defines the job record, its lifecycle states, the events
//! emitted on state changes, and the configuration shared by the store,
//! the engine and the CLI.

#![warn(missing_docs)]

mod id;
mod job;
mod event;
mod config;

pub use id::JobId;
pub use job::{
    Expected, Job, JobFilter, JobLogEntry, JobSpec, JobStatus, JobUpdate, ParseEnumError, Priority,
    ResourceRequirements, RetryConfig, CPU_UNITS, MEMORY_MB,
};
pub use event::{JobEvent, JobEventKind};
pub use config::{
    ConfigError, DatabaseConfig, DependencyFailurePolicy, SchedulerConfig, SmartqConfig,
    DEFAULT_CONFIG_FILE,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
