//! The node's background tasks. Each runs until its `CancellationToken` fires or its input closes. None of them should
//! be awaited before shutdown.
use std::{sync::Arc, time::Duration};

use agora_engine::{
    db::PublicData,
    events::{BlockReceived, EventHooks, TransactionReceived},
    messenger::PeerEnvelope,
    traits::Wallet,
    EventBus,
    OrderFlowApi,
};
use log::*;
use tokio::{
    sync::{broadcast::error::RecvError, mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Feeds every envelope that arrives from the network to the order processor.
pub fn start_inbound_worker(
    api: OrderFlowApi,
    mut inbound: mpsc::UnboundedReceiver<PeerEnvelope>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("📨️ Inbound message worker started");
        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = inbound.recv() => envelope,
            };
            let Some(envelope) = envelope else {
                warn!("📨️ The network connection closed");
                break;
            };
            match api.handle_envelope(&envelope).await {
                Ok(Some(outcome)) => {
                    debug!("📨️ {} from {}: {outcome:?}", envelope.message_id, envelope.sender.short())
                },
                Ok(None) => trace!("📨️ {} from {} handled", envelope.message_id, envelope.sender.short()),
                Err(e) => warn!("📨️ Could not handle {} from {}. {e}", envelope.message_id, envelope.sender.short()),
            }
        }
        info!("📨️ Inbound message worker stopped");
    })
}

/// Applies the wallet's transactions to the orders they touch, and republishes transactions and new blocks on the
/// event bus.
pub fn start_wallet_worker(
    api: OrderFlowApi,
    wallet: Arc<dyn Wallet>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut transactions = wallet.subscribe_transactions();
    let mut blocks = wallet.subscribe_blocks();
    tokio::spawn(async move {
        let coin = wallet.coin().to_string();
        let events = api.events().clone();
        info!("👛️ {coin} wallet worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                transaction = transactions.recv() => match transaction {
                    Ok(transaction) => {
                        events.publish(TransactionReceived { coin: coin.clone(), transaction: transaction.clone() });
                        match api.process_transaction(&coin, transaction).await {
                            Ok(orders) if !orders.is_empty() => {
                                let ids = orders.iter().map(|o| o.as_str()).collect::<Vec<_>>().join(", ");
                                debug!("👛️ {coin} transaction touched orders {ids}");
                            },
                            Ok(_) => {},
                            Err(e) => error!("👛️ Could not apply a {coin} transaction. {e}"),
                        }
                    },
                    Err(RecvError::Lagged(n)) => {
                        warn!("👛️ The {coin} wallet worker missed {n} transactions. Rescanning open orders");
                        if let Err(e) = api.rescan_open_orders(&coin).await {
                            error!("👛️ Could not rescan {coin} payment addresses. {e}");
                        }
                    },
                    Err(RecvError::Closed) => break,
                },
                block = blocks.recv() => match block {
                    Ok(height) => {
                        trace!("👛️ New {coin} block at {height}");
                        events.publish(BlockReceived { coin: coin.clone(), height, hash: String::new() });
                    },
                    Err(RecvError::Lagged(n)) => debug!("👛️ The {coin} wallet worker skipped {n} blocks"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("👛️ {coin} wallet worker stopped");
    })
}

/// Resends unacknowledged messages with backoff.
pub fn start_messenger_worker(api: &OrderFlowApi, shutdown: CancellationToken) -> JoinHandle<()> {
    let messenger = api.messenger().clone();
    tokio::spawn(messenger.run(shutdown))
}

/// Re-hashes the public data directory every `interval` and announces the new root whenever it changes.
pub fn start_publisher(
    public: PublicData,
    interval: Duration,
    published: watch::Sender<Option<String>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        info!("🗃️ Public data publisher started for {}", public.root().display());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {},
            }
            let root = match public.root_hash().await {
                Ok(root) => root,
                Err(e) => {
                    error!("🗃️ Could not hash the public data directory. {e}");
                    continue;
                },
            };
            let unchanged = published.borrow().as_deref() == Some(root.as_str());
            if unchanged {
                trace!("🗃️ Public data unchanged ({root})");
            } else {
                info!("🗃️ Publishing public data with root {root}");
                published.send_replace(Some(root));
            }
        }
        info!("🗃️ Public data publisher stopped");
    })
}

/// Hooks that log what happens to the node's orders.
pub fn logging_hooks() -> EventHooks {
    let mut hooks = EventHooks::default();
    hooks
        .on_new_order(|ev| {
            Box::pin(async move {
                info!("🔄️ New order {} ({:?}) for {} {}", ev.order_id, ev.role, ev.amount, ev.coin);
            })
        })
        .on_order_funded(|ev| {
            Box::pin(async move {
                info!("🔄️ Order {} is funded with {}", ev.order_id, ev.funding_total);
            })
        })
        .on_order_completion(|ev| {
            Box::pin(async move {
                info!("🔄️ Order {} is complete with {} ratings", ev.order_id, ev.ratings);
            })
        })
        .on_dispute_open(|ev| {
            Box::pin(async move {
                warn!("🔄️ The {:?} opened a dispute on order {}: {}", ev.opened_by, ev.order_id, ev.claim);
            })
        })
        .on_payment_finalized(|ev| {
            Box::pin(async move {
                info!("🔄️ Funds for order {} were released in {}", ev.order_id, ev.txid);
            })
        })
        .on_message_errored(|ev| {
            Box::pin(async move {
                warn!("🔄️ A {} message for order {} was refused. {}", ev.kind, ev.order_id, ev.error);
            })
        });
    hooks
}

/// Starts the logging hooks on `bus`.
pub fn start_event_handlers(bus: &EventBus, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    agora_engine::events::EventHandlers::new(bus, logging_hooks()).start_handlers(shutdown)
}
