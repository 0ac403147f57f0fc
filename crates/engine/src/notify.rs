//! Best-effort status notifications.

use smartq_core::JobEvent;
use smartq_storage::Storage;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Fan-out channel for [`JobEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is dropped, and slow subscribers skip ahead (`RecvError::Lagged`).
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<JobEvent>,
}

impl Notifier {
    /// Create a channel buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send an event to every current subscriber.
    pub fn publish(&self, event: JobEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            trace!(job_id = %event.job_id, "No subscribers, event dropped");
        }
    }

    /// Append the event to the job's trace, then publish it.
    ///
    /// A failed append is logged and skipped; the trace never decides a
    /// job's state.
    pub async fn record(&self, storage: &dyn Storage, event: JobEvent) {
        if let Err(e) = storage.append_log(event.job_id, &event.message, event.timestamp).await {
            warn!(job_id = %event.job_id, kind = ?event.kind, error = %e, "Could not append job log");
        }
        self.publish(event);
    }

    /// Receive events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}
