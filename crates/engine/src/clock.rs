//! Wall-clock source for timestamps and `run_at` comparisons.

use std::fmt;

use smartq_core::Time;

/// Source of "now" for the engine and the job service.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Time;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Time {
        chrono::Utc::now()
    }
}

/// Wall time derived from the tokio clock.
///
/// Captures the wall clock once and then advances with
/// `tokio::time::Instant`, so timestamps follow `tokio::time::pause` and
/// `advance` in tests.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: Time,
    start: tokio::time::Instant,
}

impl TokioClock {
    /// Anchor a new clock at the current wall time.
    pub fn new() -> Self {
        Self {
            origin: chrono::Utc::now(),
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Time {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + elapsed
    }
}
