//! Execution layer - candidate selection, dependency gating, resource
//! admission, supervised execution and retries.

#![warn(missing_docs)]

pub mod body;
pub mod clock;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod recovery;
pub mod retry;
pub mod selector;
pub mod service;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use body::{JobBody, SimulatedWork};
pub use clock::{Clock, SystemClock, TokioClock};
pub use dependency::{DependencyResolver, Readiness};
pub use engine::{CycleResult, EngineConfig, ExecutionEngine};
pub use error::{EngineError, ExecutionError, Result};
pub use ledger::{Reservation, ResourceLedger};
pub use notify::Notifier;
pub use recovery::RecoveryReport;
pub use retry::{FailureOutcome, RetryController, RetryDecision, RetryPolicy};
pub use selector::{Admission, CandidateSelector, PrioritySelector, Selection};
pub use service::{JobService, Submission};
pub use supervisor::{Claim, RunOutcome, Supervisor};
