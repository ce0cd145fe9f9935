use std::{future::Future, pin::Pin, sync::Arc};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{
    BusEvent,
    DisputeOpen,
    DomainEvent,
    EventBus,
    EventHandler,
    Handler,
    MessageErrored,
    NewOrder,
    OrderCompletion,
    OrderFunded,
    PaymentFinalized,
};

type BoxedFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callbacks a node owner can attach to the engine's events.
#[derive(Default, Clone)]
pub struct EventHooks {
    pub on_new_order: Option<Handler<NewOrder>>,
    pub on_order_funded: Option<Handler<OrderFunded>>,
    pub on_order_completion: Option<Handler<OrderCompletion>>,
    pub on_dispute_open: Option<Handler<DisputeOpen>>,
    pub on_payment_finalized: Option<Handler<PaymentFinalized>>,
    pub on_message_errored: Option<Handler<MessageErrored>>,
    pub on_any: Option<Handler<DomainEvent>>,
}

impl EventHooks {
    pub fn on_new_order<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(NewOrder) -> BoxedFuture) + Send + Sync + 'static {
        self.on_new_order = Some(Arc::new(f));
        self
    }

    pub fn on_order_funded<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(OrderFunded) -> BoxedFuture) + Send + Sync + 'static {
        self.on_order_funded = Some(Arc::new(f));
        self
    }

    pub fn on_order_completion<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(OrderCompletion) -> BoxedFuture) + Send + Sync + 'static {
        self.on_order_completion = Some(Arc::new(f));
        self
    }

    pub fn on_dispute_open<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(DisputeOpen) -> BoxedFuture) + Send + Sync + 'static {
        self.on_dispute_open = Some(Arc::new(f));
        self
    }

    pub fn on_payment_finalized<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(PaymentFinalized) -> BoxedFuture) + Send + Sync + 'static {
        self.on_payment_finalized = Some(Arc::new(f));
        self
    }

    pub fn on_message_errored<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(MessageErrored) -> BoxedFuture) + Send + Sync + 'static {
        self.on_message_errored = Some(Arc::new(f));
        self
    }

    pub fn on_any<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(DomainEvent) -> BoxedFuture) + Send + Sync + 'static {
        self.on_any = Some(Arc::new(f));
        self
    }
}

/// Subscriptions for every hook that was set. Subscribing happens in [`EventHandlers::new`], so events published
/// between construction and [`EventHandlers::start_handlers`] are not lost.
pub struct EventHandlers {
    on_new_order: Option<EventHandler<NewOrder>>,
    on_order_funded: Option<EventHandler<OrderFunded>>,
    on_order_completion: Option<EventHandler<OrderCompletion>>,
    on_dispute_open: Option<EventHandler<DisputeOpen>>,
    on_payment_finalized: Option<EventHandler<PaymentFinalized>>,
    on_message_errored: Option<EventHandler<MessageErrored>>,
    on_any: Option<EventHandler<DomainEvent>>,
}

fn typed<E: BusEvent>(bus: &EventBus, name: &'static str, hook: Option<Handler<E>>) -> Option<EventHandler<E>> {
    hook.map(|f| EventHandler::new(name, bus.subscribe::<E>(), f))
}

impl EventHandlers {
    pub fn new(bus: &EventBus, hooks: EventHooks) -> Self {
        Self {
            on_new_order: typed(bus, "NewOrder", hooks.on_new_order),
            on_order_funded: typed(bus, "OrderFunded", hooks.on_order_funded),
            on_order_completion: typed(bus, "OrderCompletion", hooks.on_order_completion),
            on_dispute_open: typed(bus, "DisputeOpen", hooks.on_dispute_open),
            on_payment_finalized: typed(bus, "PaymentFinalized", hooks.on_payment_finalized),
            on_message_errored: typed(bus, "MessageErrored", hooks.on_message_errored),
            on_any: hooks.on_any.map(|f| EventHandler::new("any", bus.subscribe_all(), f)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.on_new_order.is_none() &&
            self.on_order_funded.is_none() &&
            self.on_order_completion.is_none() &&
            self.on_dispute_open.is_none() &&
            self.on_payment_finalized.is_none() &&
            self.on_message_errored.is_none() &&
            self.on_any.is_none()
    }

    /// Spawns one task per active hook and returns their handles.
    pub fn start_handlers(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        fn spawn<E: Clone + Send + 'static>(
            tasks: &mut Vec<JoinHandle<()>>,
            handler: Option<EventHandler<E>>,
            shutdown: &CancellationToken,
        ) {
            if let Some(handler) = handler {
                tasks.push(tokio::spawn(handler.start_handler(shutdown.clone())));
            }
        }
        spawn(&mut tasks, self.on_new_order, &shutdown);
        spawn(&mut tasks, self.on_order_funded, &shutdown);
        spawn(&mut tasks, self.on_order_completion, &shutdown);
        spawn(&mut tasks, self.on_dispute_open, &shutdown);
        spawn(&mut tasks, self.on_payment_finalized, &shutdown);
        spawn(&mut tasks, self.on_message_errored, &shutdown);
        spawn(&mut tasks, self.on_any, &shutdown);
        tasks
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        db_types::{MessageKind, OrderId},
        events::OrderCancel,
    };

    #[tokio::test]
    async fn hooks_fire_for_their_events_only() {
        let bus = EventBus::new(16);
        let errored = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));
        let mut hooks = EventHooks::default();
        let e2 = errored.clone();
        let a2 = any.clone();
        hooks
            .on_message_errored(move |_| {
                let e = e2.clone();
                Box::pin(async move {
                    e.fetch_add(1, Ordering::SeqCst);
                })
            })
            .on_any(move |_| {
                let a = a2.clone();
                Box::pin(async move {
                    a.fetch_add(1, Ordering::SeqCst);
                })
            });
        let handlers = EventHandlers::new(&bus, hooks);
        assert!(!handlers.is_empty());
        bus.publish(MessageErrored {
            order_id: OrderId::new("o"),
            kind: MessageKind::OrderCancel,
            error: "nope".into(),
        });
        bus.publish(OrderCancel { order_id: OrderId::new("o") });
        let shutdown = CancellationToken::new();
        let tasks = handlers.start_handlers(shutdown.clone());
        assert_eq!(tasks.len(), 2);
        drop(bus);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(errored.load(Ordering::SeqCst), 1);
        assert_eq!(any.load(Ordering::SeqCst), 2);
    }
}
