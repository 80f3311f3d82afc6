//! Realtime "object changed" notifications.
//!
//! The cache only consumes this stream: a failed fetch waits for an
//! [`Updated`](EventKind::Updated) event of the object the resource belongs to before it is
//! retried. [`UpdateEventHub`] is the in-process fan-out that the realtime transport publishes
//! into.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::identity::ObjectIdentifier;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// A realtime notification about a domain object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub event: EventKind,
    pub object: ObjectIdentifier,
}

impl UpdateEvent {
    pub fn updated(object: ObjectIdentifier) -> Self {
        Self {
            event: EventKind::Updated,
            object,
        }
    }

    /// Whether this event announces an update of `object`.
    pub fn is_update_of(&self, object: &ObjectIdentifier) -> bool {
        self.event == EventKind::Updated && &self.object == object
    }
}

/// A source of realtime update events.
pub trait UpdateEvents: Send + Sync {
    /// Starts receiving events.
    ///
    /// Only events published after this call are delivered to the subscription.
    fn subscribe(&self) -> UpdateSubscription;
}

/// Tokio broadcast-backed [`UpdateEvents`] implementation.
#[derive(Debug, Clone)]
pub struct UpdateEventHub {
    sender: Sender<UpdateEvent>,
}

impl UpdateEventHub {
    /// Creates a hub that buffers up to `capacity` events per subscriber, at least one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Returns the number of subscribers the event was delivered to. Publishing without any
    /// subscribers is not an error.
    pub fn publish(&self, event: UpdateEvent) -> usize {
        tracing::trace!(object = %event.object, kind = ?event.event, "publishing update event");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for UpdateEventHub {
    fn default() -> Self {
        Self::new(512)
    }
}

impl UpdateEvents for UpdateEventHub {
    fn subscribe(&self) -> UpdateSubscription {
        UpdateSubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

/// How waiting for an update ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A matching update was received.
    Updated,
    /// The event source went away.
    Closed,
}

/// Handle returned to subscribers.
#[derive(Debug)]
pub struct UpdateSubscription {
    receiver: Receiver<UpdateEvent>,
}

impl UpdateSubscription {
    /// Receives the next event, or `None` once the source is closed.
    pub async fn recv(&mut self) -> Option<UpdateEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "update subscriber lagged behind");
                }
            }
        }
    }

    /// Waits for the first `Updated` event of `object`.
    ///
    /// Events of other kinds or for other objects are skipped. There is no timeout at this
    /// level, callers bound the wait themselves.
    pub async fn wait_for_update(&mut self, object: &ObjectIdentifier) -> WaitOutcome {
        while let Some(event) = self.recv().await {
            if event.is_update_of(object) {
                return WaitOutcome::Updated;
            }
            tracing::trace!(
                object = %event.object,
                kind = ?event.event,
                "skipping unrelated event"
            );
        }
        WaitOutcome::Closed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::identity::ObjectType;

    use super::*;

    fn picture(id: &str) -> ObjectIdentifier {
        ObjectIdentifier::new(ObjectType::UserPicture, id)
    }

    #[test]
    fn test_deserialize_event() {
        let json = r#"{
            "event": "Updated",
            "object": { "objectType": "USER_PICTURE", "objectId": "abc" }
        }"#;
        let event: UpdateEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event, UpdateEvent::updated(picture("abc")));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = UpdateEventHub::default();
        assert_eq!(hub.publish(UpdateEvent::updated(picture("abc"))), 0);
    }

    #[tokio::test]
    async fn test_wait_skips_unrelated_events() {
        let hub = UpdateEventHub::default();
        let mut subscription = hub.subscribe();

        hub.publish(UpdateEvent {
            event: EventKind::Created,
            object: picture("abc"),
        });
        hub.publish(UpdateEvent::updated(picture("def")));
        hub.publish(UpdateEvent {
            event: EventKind::Updated,
            object: ObjectIdentifier::new(ObjectType::ProjectPicture, "abc"),
        });

        let abc = picture("abc");
        let wait = subscription.wait_for_update(&abc);
        let pending = tokio::time::timeout(Duration::from_millis(50), wait).await;
        assert!(pending.is_err());

        hub.publish(UpdateEvent::updated(picture("abc")));
        let outcome = subscription.wait_for_update(&abc).await;
        assert_eq!(outcome, WaitOutcome::Updated);
    }

    #[tokio::test]
    async fn test_zero_capacity_hub() {
        let hub = UpdateEventHub::new(0);
        let mut subscription = hub.subscribe();

        assert_eq!(hub.publish(UpdateEvent::updated(picture("abc"))), 1);
        let outcome = subscription.wait_for_update(&picture("abc")).await;
        assert_eq!(outcome, WaitOutcome::Updated);
    }

    #[tokio::test]
    async fn test_wait_on_closed_hub() {
        let hub = UpdateEventHub::default();
        let mut subscription = hub.subscribe();
        drop(hub);

        let outcome = subscription.wait_for_update(&picture("abc")).await;
        assert_eq!(outcome, WaitOutcome::Closed);
    }

    #[tokio::test]
    async fn test_events_before_subscribing_are_not_seen() {
        let hub = UpdateEventHub::default();
        let _keepalive = hub.subscribe();
        hub.publish(UpdateEvent::updated(picture("abc")));

        let mut subscription = hub.subscribe();
        let abc = picture("abc");
        let wait = subscription.wait_for_update(&abc);
        let pending = tokio::time::timeout(Duration::from_millis(50), wait).await;
        assert!(pending.is_err());
    }
}
