use std::sync::Arc;

use log::*;
use tokio::sync::broadcast;

use crate::events::{DomainEvent, TypedChannels};

const DEFAULT_CAPACITY: usize = 256;

/// An event type that can be subscribed to on its own.
pub trait BusEvent: Clone + Send + 'static {
    #[doc(hidden)]
    fn channel(channels: &TypedChannels) -> &broadcast::Sender<Self>;
}

/// Typed, in-process publish/subscribe.
///
/// Publishing never blocks. Subscribers that fall more than the channel capacity behind miss events and see a
/// `Lagged` error on their next receive.
#[derive(Clone)]
pub struct EventBus {
    all: broadcast::Sender<DomainEvent>,
    typed: Arc<TypedChannels>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        Self { all, typed: Arc::new(TypedChannels::new(capacity)) }
    }

    pub fn subscribe<E: BusEvent>(&self) -> broadcast::Receiver<E> {
        E::channel(&self.typed).subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<DomainEvent> {
        self.all.subscribe()
    }

    pub fn publish<E: Into<DomainEvent>>(&self, event: E) {
        let event = event.into();
        trace!("📬️ Publishing {}", event.name());
        self.typed.route(&event);
        let _ = self.all.send(event);
    }

    pub fn publish_all<I: IntoIterator<Item = DomainEvent>>(&self, events: I) {
        events.into_iter().for_each(|e| self.publish(e));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        db_types::OrderId,
        events::{OrderCancel, OrderConfirmation},
    };

    #[tokio::test]
    async fn typed_subscribers_only_see_their_type() {
        let bus = EventBus::new(16);
        let mut cancels = bus.subscribe::<OrderCancel>();
        let mut everything = bus.subscribe_all();
        bus.publish(OrderConfirmation { order_id: OrderId::new("a") });
        bus.publish(OrderCancel { order_id: OrderId::new("b") });
        let cancel = cancels.recv().await.unwrap();
        assert_eq!(cancel.order_id, OrderId::new("b"));
        assert!(cancels.try_recv().is_err());
        assert_eq!(everything.recv().await.unwrap().name(), "OrderConfirmation");
        let second = everything.recv().await.unwrap();
        assert_eq!(second.order_id(), Some(&OrderId::new("b")));
    }

    #[tokio::test]
    async fn slow_subscribers_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe::<OrderCancel>();
        for i in 0..5 {
            bus.publish(OrderCancel { order_id: OrderId::new(format!("{i}")) });
        }
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().order_id, OrderId::new("3"));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(OrderCancel { order_id: OrderId::new("x") });
    }
}
