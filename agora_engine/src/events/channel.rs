//! Async event handlers fed from the [`EventBus`](crate::events::EventBus).
//!
//! A handler owns a subscription to one event type and runs its callback on a fresh task for every event. Handlers have
//! no access to engine state; all they receive is the event.
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use log::*;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;

pub type Handler<E> = Arc<dyn Fn(E) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct EventHandler<E: Clone + Send + 'static> {
    name: &'static str,
    listener: Receiver<E>,
    handler: Handler<E>,
}

impl<E: Clone + Send + 'static> EventHandler<E> {
    pub fn new(name: &'static str, listener: Receiver<E>, handler: Handler<E>) -> Self {
        Self { name, listener, handler }
    }

    /// Runs until the bus is dropped or `shutdown` fires, then waits for in-flight callbacks to finish.
    pub async fn start_handler(mut self, shutdown: CancellationToken) {
        debug!("📬️ Starting {} handler", self.name);
        let jobs = Arc::new(AtomicI64::new(0));
        loop {
            let ev = tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = self.listener.recv() => ev,
            };
            match ev {
                Ok(ev) => {
                    trace!("📬️ {} handling event", self.name);
                    let handler = Arc::clone(&self.handler);
                    jobs.fetch_add(1, Ordering::SeqCst);
                    let job = jobs.clone();
                    tokio::spawn(async move {
                        (handler)(ev).await;
                        job.fetch_sub(1, Ordering::SeqCst);
                    });
                },
                Err(RecvError::Lagged(n)) => warn!("📬️ {} handler fell behind and missed {n} events", self.name),
                Err(RecvError::Closed) => break,
            }
        }
        while jobs.load(Ordering::SeqCst) > 0 {
            debug!("📬️ Waiting for {} jobs to complete", self.name);
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }
        debug!("📬️ {} handler has shut down", self.name);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::{
        db_types::{OrderId, Role},
        events::{EventBus, OrderFunded},
    };
    use agora_common::Amount;

    #[tokio::test]
    async fn handler_runs_for_every_event() {
        let _ = env_logger::try_init();
        let bus = EventBus::new(32);
        let total = Arc::new(AtomicU64::new(0));
        let t2 = total.clone();
        let handler: Handler<OrderFunded> = Arc::new(move |ev: OrderFunded| {
            let total = total.clone();
            Box::pin(async move {
                let v = ev.funding_total.to_string().parse::<u64>().unwrap_or(0);
                total.fetch_add(v, Ordering::SeqCst);
                tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        let shutdown = CancellationToken::new();
        let event_handler = EventHandler::new("funded", bus.subscribe::<OrderFunded>(), handler);
        let task = tokio::spawn(event_handler.start_handler(shutdown.clone()));
        for i in 0..10u64 {
            let order_id = OrderId::new(format!("o{i}"));
            bus.publish(OrderFunded { order_id, role: Role::Vendor, funding_total: Amount::from(i) });
        }
        drop(bus);
        task.await.unwrap();
        assert_eq!(t2.load(Ordering::SeqCst), 45);
    }
}
