//! Post-commit event delivery.
//!
//! Events are published only after the unit of work that produced them has
//! committed. Delivery is fire-and-forget: a subscriber that lags or is
//! missing never affects the booking transition.

use booking_core::events::BookingEvent;
use tokio::sync::broadcast;

/// Sink for committed domain events
pub trait EventPublisher: Send + Sync {
    /// Hands one event to subscribers
    fn publish(&self, event: &BookingEvent);
}

/// In-process fan-out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<BookingEvent>,
}

impl BroadcastPublisher {
    /// Creates a bus buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BookingEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: &BookingEvent) {
        // Err only means nobody is listening.
        let receivers = self.sender.send(event.clone()).unwrap_or(0);
        tracing::debug!(
            booking_id = %event.booking_id(),
            event = event.name(),
            receivers,
            "event published"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use booking_core::types::BookingId;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = BroadcastPublisher::new(8);
        let mut rx = bus.subscribe();
        let booking_id = BookingId::new();

        bus.publish(&BookingEvent::BookingUnassignable {
            booking_id,
            remaining_candidates: 0,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.booking_id(), booking_id);
        assert_eq!(event.name(), "booking_unassignable");
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        BroadcastPublisher::default().publish(&BookingEvent::BookingUnassignable {
            booking_id: BookingId::new(),
            remaining_candidates: 1,
        });
    }
}
