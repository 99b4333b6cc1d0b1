use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use fixr_core::Notifier;
use fixr_shared::{BookingEvent, Envelope, Recipient};
use futures_util::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

type Registry = RwLock<HashMap<Recipient, broadcast::Sender<Envelope>>>;

/// In-process pub/sub keyed by recipient. Publishing never blocks; events for
/// a recipient with no live subscription are dropped.
#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, recipient: Recipient) -> Subscription {
        let mut channels = match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let rx = channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        debug!("Subscribed {:?}", recipient);
        Subscription {
            stream: BroadcastStream::new(rx),
            recipient,
            channels: Arc::clone(&self.channels),
        }
    }

    pub fn subscriber_count(&self, recipient: Recipient) -> usize {
        let channels = match self.channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels.get(&recipient).map(|tx| tx.receiver_count()).unwrap_or(0)
    }
}

impl Notifier for EventBus {
    fn publish(&self, recipient: Recipient, event: BookingEvent) {
        let channels = match self.channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match channels.get(&recipient) {
            Some(tx) => {
                debug!("Publishing {} for booking {} to {:?}", event.name(), event.booking_id(), recipient);
                // Err only means every receiver went away since the lookup
                let _ = tx.send(Envelope::new(recipient, event));
            }
            None => debug!("No subscriber for {:?}, dropping {}", recipient, event.name()),
        }
    }
}

/// Live event feed for one recipient. Dropping it unsubscribes.
pub struct Subscription {
    stream: BroadcastStream<Envelope>,
    recipient: Recipient,
    channels: Arc<Registry>,
}

impl Subscription {
    pub fn recipient(&self) -> Recipient {
        self.recipient
    }
}

impl Stream for Subscription {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(envelope))) => return Poll::Ready(Some(envelope)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    // Clients re-fetch on reconnect, so a slow reader just loses hints
                    warn!("Subscriber {:?} lagged, skipped {} events", self.recipient, skipped);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut channels = match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Our own receiver is still alive here
        let last = channels
            .get(&self.recipient)
            .map(|tx| tx.receiver_count() <= 1)
            .unwrap_or(false);
        if last {
            channels.remove(&self.recipient);
            debug!("Unsubscribed {:?}", self.recipient);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use uuid::Uuid;

    fn started(booking_id: Uuid) -> BookingEvent {
        BookingEvent::ServiceStarted { booking_id }
    }

    #[tokio::test]
    async fn test_events_reach_only_their_recipient() {
        let bus = EventBus::new();
        let alice = Recipient::Customer(Uuid::new_v4());
        let bob = Recipient::Technician(Uuid::new_v4());

        let mut alice_feed = bus.subscribe(alice);
        let mut bob_feed = bus.subscribe(bob);

        let booking_id = Uuid::new_v4();
        bus.publish(alice, started(booking_id));

        let envelope = alice_feed.next().await.unwrap();
        assert_eq!(envelope.recipient, alice);
        assert_eq!(envelope.event.booking_id(), booking_id);

        let nothing = tokio::time::timeout(std::time::Duration::from_millis(20), bob_feed.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let tech = Recipient::Technician(Uuid::new_v4());

        let first = bus.subscribe(tech);
        let second = bus.subscribe(tech);
        assert_eq!(bus.subscriber_count(tech), 2);

        drop(first);
        assert_eq!(bus.subscriber_count(tech), 1);
        drop(second);
        assert_eq!(bus.subscriber_count(tech), 0);

        // Publishing with nobody listening is a no-op
        bus.publish(tech, started(Uuid::new_v4()));
    }
}
