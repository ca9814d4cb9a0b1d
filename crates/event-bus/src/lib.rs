//! # Event bus
//!
//! In-process publish/subscribe by message type. Subscribers receive their
//! own unbounded channel per subscription; publishing clones the message to
//! every live subscriber of that type. Delivery is at-most-once within the
//! process and there is no ordering guarantee between distinct publishers.
//!
//! ## Example
//!
//! ```rust
//! use event_bus::EventBus;
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct Ping(u32);
//!
//! smol::block_on(async {
//!     let bus = EventBus::new();
//!     let events = bus.subscribe::<Ping>();
//!     bus.publish(Ping(1));
//!     assert_eq!(events.recv().await.unwrap(), Ping(1));
//! });
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

type SenderList = Vec<Box<dyn Any + Send>>;

/// In-process typed publish/subscribe bus. Cheap to clone; clones share the
/// subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<TypeId, SenderList>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        EventBus { subscribers: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Subscribe to all future messages of type `E`. Dropping the receiver
    /// ends the subscription; the sender side is pruned on the next publish.
    pub fn subscribe<E: Clone + Send + 'static>(&self) -> async_channel::Receiver<E> {
        let (tx, rx) = async_channel::unbounded::<E>();
        let mut subscribers = self.subscribers.lock().expect("bus lock poisoned");
        subscribers.entry(TypeId::of::<E>()).or_default().push(Box::new(tx));
        rx
    }

    /// Publish a message to every live subscriber of its type. Publishing
    /// never blocks: subscriptions are unbounded, and closed subscriptions
    /// are dropped here.
    pub fn publish<E: Clone + Send + 'static>(&self, event: E) {
        let mut subscribers = self.subscribers.lock().expect("bus lock poisoned");
        let Some(list) = subscribers.get_mut(&TypeId::of::<E>()) else {
            trace!(event = type_name::<E>(), "no subscribers");
            return;
        };
        list.retain(|entry| {
            let sender = entry
                .downcast_ref::<async_channel::Sender<E>>()
                .expect("subscriber list holds senders of its key type");
            sender.try_send(event.clone()).is_ok()
        });
        if list.is_empty() {
            subscribers.remove(&TypeId::of::<E>());
        }
    }

    /// Number of live subscriptions for type `E` (for tests and
    /// observability).
    pub fn subscriber_count<E: Clone + Send + 'static>(&self) -> usize {
        let subscribers = self.subscribers.lock().expect("bus lock poisoned");
        subscribers.get(&TypeId::of::<E>()).map(|l| l.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.lock().expect("bus lock poisoned");
        f.debug_struct("EventBus").field("types", &subscribers.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Ping(u32);

    #[derive(Clone, Debug, PartialEq)]
    struct Pong(&'static str);

    #[smol_potat::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe::<Ping>();
        let b = bus.subscribe::<Ping>();
        bus.publish(Ping(7));
        assert_eq!(a.recv().await.unwrap(), Ping(7));
        assert_eq!(b.recv().await.unwrap(), Ping(7));
    }

    #[smol_potat::test]
    async fn test_types_are_isolated() {
        let bus = EventBus::new();
        let pings = bus.subscribe::<Ping>();
        let pongs = bus.subscribe::<Pong>();
        bus.publish(Ping(1));
        bus.publish(Pong("x"));
        assert_eq!(pings.recv().await.unwrap(), Ping(1));
        assert_eq!(pongs.recv().await.unwrap(), Pong("x"));
        assert!(pings.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe::<Ping>();
        assert_eq!(bus.subscriber_count::<Ping>(), 1);
        drop(rx);
        bus.publish(Ping(1));
        assert_eq!(bus.subscriber_count::<Ping>(), 0);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(Ping(1));
        assert_eq!(bus.subscriber_count::<Ping>(), 0);
    }

    #[smol_potat::test]
    async fn test_subscription_sees_only_later_events() {
        let bus = EventBus::new();
        bus.publish(Ping(1));
        let rx = bus.subscribe::<Ping>();
        bus.publish(Ping(2));
        assert_eq!(rx.recv().await.unwrap(), Ping(2));
        assert!(rx.try_recv().is_err());
    }
}
