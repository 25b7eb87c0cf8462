//! Lifecycle and timer events produced by the scheduling core.

use gridmesh_common::{KernelId, SessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Machine-readable reasons recorded in `status_info` and carried by
/// cancellation events.
pub mod reasons {
    pub const PENDING_TIMEOUT: &str = "pending-timeout";
    pub const FAILED_TO_START: &str = "failed-to-start";
    pub const NO_AVAILABLE_INSTANCES: &str = "no-available-instances";
    pub const PREDICATE_CHECKS_FAILED: &str = "predicate-checks-failed";
    pub const SCHEDULER_ERROR: &str = "scheduler-error";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingEvent {
    SessionEnqueued { session_id: SessionId },
    SessionScheduled { session_id: SessionId, creation_id: String },
    SessionPreparing { session_id: SessionId, creation_id: String },
    SessionCancelled { session_id: SessionId, creation_id: String, reason: String },
    SessionStarted { session_id: SessionId, creation_id: String },
    SessionTerminating { session_id: SessionId, reason: String },
    SessionTerminated { session_id: SessionId, reason: String },
    KernelCancelled { kernel_id: KernelId, reason: String },
    KernelTerminating { kernel_id: KernelId, reason: String },
    KernelTerminated { kernel_id: KernelId, reason: String },
    RouteCreated { route_id: String },
    /// Timer ticks driving the dispatcher stages.
    DoSchedule,
    DoCheckPrecond,
    DoStartSession,
    DoScale,
}

/// Broadcast fan-out of scheduling events. Producing never blocks and never
/// fails; an event with no subscribers is simply dropped.
#[derive(Debug, Clone)]
pub struct EventProducer {
    tx: broadcast::Sender<SchedulingEvent>,
}

impl EventProducer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn produce(&self, event: SchedulingEvent) {
        trace!(?event, "producing scheduling event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulingEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventProducer {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_to_subscribers() {
        let producer = EventProducer::default();
        let mut rx = producer.subscribe();
        producer.produce(SchedulingEvent::DoSchedule);
        assert_eq!(rx.recv().await.unwrap(), SchedulingEvent::DoSchedule);
    }

    #[test]
    fn producing_without_subscribers_is_fine() {
        EventProducer::default().produce(SchedulingEvent::DoScale);
    }
}
