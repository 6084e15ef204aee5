//! Domain event bus — fan-out of committed (or published-only) network events.

use tokio::sync::broadcast;

use crate::event::NetworkEvent;

/// Broadcast channel of [`NetworkEvent`]s.
///
/// Publishing with no subscribers is not an error; the event is dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events. Subscribe before publishing to avoid gaps.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NetworkEvent) {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => tracing::debug!(event = kind, receivers, "Event published"),
            Err(_) => tracing::debug!(event = kind, "Event published with no subscribers"),
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = NetworkEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
