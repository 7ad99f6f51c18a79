//! Fire-and-forget event recording

use strand_types::{EventType, ObjectReference, RecordedEvent};
use tokio::sync::broadcast;

/// Sink for events about managed objects. Delivery is not guaranteed.
pub trait EventRecorder: Send + Sync {
    fn record(&self, involved: ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Recorder that logs each event and fans it out to subscribers
#[derive(Debug, Clone)]
pub struct BroadcastRecorder {
    tx: broadcast::Sender<RecordedEvent>,
}

impl Default for BroadcastRecorder {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl BroadcastRecorder {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordedEvent> {
        self.tx.subscribe()
    }
}

impl EventRecorder for BroadcastRecorder {
    fn record(&self, involved: ObjectReference, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => tracing::info!(
                kind = %involved.kind,
                namespace = %involved.namespace,
                name = %involved.name,
                reason,
                "{}",
                message
            ),
            EventType::Warning => tracing::warn!(
                kind = %involved.kind,
                namespace = %involved.namespace,
                name = %involved.name,
                reason,
                "{}",
                message
            ),
        }
        // No subscribers is fine
        let _ = self
            .tx
            .send(RecordedEvent::new(involved, event_type, reason, message));
    }
}
