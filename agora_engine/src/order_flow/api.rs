use std::fmt::Debug;

use agora_common::Amount;
use futures_util::FutureExt;
use log::*;
use num_bigint::BigInt;
use num_rational::BigRational;

use crate::{
    db::{
        sqlite::{messages, orders, orders::OrderQueryFilter, parked},
        SqliteDatabase,
        StoreTx,
    },
    db_types::{ErroredMessage, MessageKind, OrderId, OrderRecord, ParkedMessage, PeerId, Role},
    escrow::EscrowCoordinator,
    events::{self, DomainEvent, EventBus},
    exchange_rates::ExchangeRateCache,
    helpers::NodeIdentity,
    messenger::{AckToken, Inbound, PeerEnvelope, ReliableMessenger},
    order_flow::{
        lattice::{self, stored_messages, stored_open},
        validation::{order_totals, payment_due},
        OrderFlowError,
    },
    order_messages::{OrderItem, OrderMessage, OrderOpen, SignedListing, SignedOrderMessage},
    ratings::RatingIndex,
    traits::{FeeLevel, Wallet},
    wallet::MultiWallet,
};

#[derive(Debug, Clone)]
pub struct OrderFlowConfig {
    /// How far below the quoted price a payment converted at current exchange rates may fall.
    pub price_tolerance: BigRational,
    pub fee_level: FeeLevel,
}

impl Default for OrderFlowConfig {
    fn default() -> Self {
        Self { price_tolerance: BigRational::new(BigInt::from(5), BigInt::from(100)), fee_level: FeeLevel::Normal }
    }
}

/// What became of an inbound order message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied(MessageKind),
    /// Byte-identical to a message the order already holds.
    Duplicate,
    /// Arrived before a message it depends on. It is retried after every later transition of the order.
    Parked(MessageKind),
}

/// One write transaction of the order processor, plus the delivery receipts of anything it sends.
pub(crate) struct Transition {
    pub tx: StoreTx,
    pub acks: Vec<AckToken>,
}

/// `OrderFlowApi` is the order processor. Every order message, inbound or local, and every wallet transaction that
/// touches an order goes through it.
///
/// Each call runs as a single store transaction under the writer lock: the message is checked against the
/// transition lattice, its side effects are applied, and it is stored together with the order's new summary state.
/// Outgoing messages and events are released only if that transaction commits. Messages that arrive ahead of their
/// prerequisites are parked, and every successful transition retries the order's parked messages.
#[derive(Clone)]
pub struct OrderFlowApi {
    pub(crate) db: SqliteDatabase,
    pub(crate) identity: NodeIdentity,
    pub(crate) wallets: MultiWallet,
    pub(crate) messenger: ReliableMessenger,
    pub(crate) events: EventBus,
    pub(crate) rates: ExchangeRateCache,
    pub(crate) config: OrderFlowConfig,
}

impl Debug for OrderFlowApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OrderFlowApi({})", self.identity.peer_id().short())
    }
}

impl OrderFlowApi {
    pub fn new(
        db: SqliteDatabase,
        identity: NodeIdentity,
        wallets: MultiWallet,
        messenger: ReliableMessenger,
        events: EventBus,
        rates: ExchangeRateCache,
    ) -> Self {
        Self { db, identity, wallets, messenger, events, rates, config: OrderFlowConfig::default() }
    }

    pub fn with_config(mut self, config: OrderFlowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn db(&self) -> &SqliteDatabase {
        &self.db
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn messenger(&self) -> &ReliableMessenger {
        &self.messenger
    }

    pub fn wallets(&self) -> &MultiWallet {
        &self.wallets
    }

    pub fn rates(&self) -> &ExchangeRateCache {
        &self.rates
    }

    /// Fetches an order with its stored messages and transactions.
    pub async fn fetch_order(&self, order_id: &OrderId) -> Result<OrderRecord, OrderFlowError> {
        let id = order_id.clone();
        let order = self.db.view(move |tx| async move { orders::fetch_order(&id, tx.conn()).await }.boxed()).await?;
        order.ok_or_else(|| OrderFlowError::NotFound(order_id.clone()))
    }

    /// The order's decoded `ORDER_OPEN`.
    pub async fn order_open(&self, order_id: &OrderId) -> Result<OrderOpen, OrderFlowError> {
        stored_open(&self.fetch_order(order_id).await?)
    }

    /// Every stored message of the order, decoded, in kind then sequence order.
    pub async fn order_messages(&self, order_id: &OrderId) -> Result<Vec<SignedOrderMessage>, OrderFlowError> {
        let order = self.fetch_order(order_id).await?;
        let mut result = Vec::with_capacity(order.messages.len());
        for kind in MessageKind::ALL {
            result.extend(stored_messages(&order, kind)?);
        }
        Ok(result)
    }

    pub async fn search_orders(&self, query: OrderQueryFilter) -> Result<Vec<OrderRecord>, OrderFlowError> {
        let result = self
            .db
            .view(move |tx| async move { orders::search_orders(query, tx.conn()).await }.boxed())
            .await?;
        Ok(result)
    }

    pub async fn parked_messages(&self, order_id: &OrderId) -> Result<Vec<ParkedMessage>, OrderFlowError> {
        let id = order_id.clone();
        let result = self.db.view(move |tx| async move { parked::fetch_parked(&id, tx.conn()).await }.boxed()).await?;
        Ok(result)
    }

    pub async fn errored_messages(&self, order_id: &OrderId) -> Result<Vec<ErroredMessage>, OrderFlowError> {
        let id = order_id.clone();
        let result = self.db.view(move |tx| async move { parked::fetch_errored(&id, tx.conn()).await }.boxed()).await?;
        Ok(result)
    }

    /// The ratings this node has published for its own listings.
    pub async fn rating_index(&self) -> Result<RatingIndex, OrderFlowError> {
        let mut tx = self.db.begin_view().await?;
        let index = RatingIndex::load(&mut tx).await?;
        tx.rollback().await?;
        Ok(index)
    }

    /// The price of a prospective order in `coin`, at current exchange rates.
    pub async fn quote(
        &self,
        listings: &[SignedListing],
        items: &[OrderItem],
        coin: &str,
    ) -> Result<Amount, OrderFlowError> {
        let dictionary = self.rates.dictionary();
        let totals = order_totals(listings, items, dictionary)?;
        let coin = dictionary.lookup(coin)?;
        let (due, _) = payment_due(&self.rates, &totals, &coin).await?;
        Ok(due)
    }

    //------------------------------------------   Inbound messages   ------------------------------------------------

    /// Applies a message received from a peer.
    ///
    /// * `Ok(Applied)`: the transition committed, and any parked messages it unblocked were retried.
    /// * `Ok(Duplicate)`: nothing changed.
    /// * `Ok(Parked)`: a prerequisite is missing. The message is kept and retried later.
    /// * `Err(_)`: the message was rejected. It is recorded as errored and a `MessageErrored` event is published.
    ///
    /// In every case the caller should acknowledge the envelope: resending the same message will not change the
    /// outcome.
    pub async fn process_message(&self, message: SignedOrderMessage) -> Result<ProcessOutcome, OrderFlowError> {
        let kind = message.kind();
        let order_id = message.order_id.clone();
        debug!("🔄️ {kind} for order {order_id} from {}", message.sender.short());
        let mut t = self.begin().await?;
        let result = match message.verify() {
            Ok(()) => self.apply_in_savepoint(&mut t, &message).await,
            Err(e) => Err(e.into()),
        };
        let outcome = match result {
            Ok(()) => {
                self.drain_parked(&mut t, &order_id).await?;
                ProcessOutcome::Applied(kind)
            },
            Err(e) if e.is_duplicate() => {
                debug!("🔄️ {kind} for order {order_id} is a duplicate");
                ProcessOutcome::Duplicate
            },
            Err(e) if e.is_parkable() => {
                let blob = message.to_blob()?;
                if parked::park_message(&order_id, kind, &blob, t.tx.conn()).await? {
                    info!("🔄️ Parked {kind} for order {order_id}: {e}");
                } else {
                    debug!("🔄️ A {kind} for order {order_id} is already parked. Keeping the first one");
                }
                ProcessOutcome::Parked(kind)
            },
            Err(e) => {
                warn!("🔄️ Rejected {kind} for order {order_id}. {e}");
                let blob = message.to_blob().unwrap_or_default();
                self.record_errored(&mut t, &order_id, kind, &blob, &e).await?;
                t.tx.commit().await?;
                return Err(e);
            },
        };
        t.tx.commit().await?;
        Ok(outcome)
    }

    /// Runs an envelope from the network through the messenger and, if it carries a new order message, through
    /// [`Self::process_message`]. The envelope is acknowledged unless the store failed, so the sender tries again.
    /// Returns `None` for ACKs and re-delivered envelopes.
    pub async fn handle_envelope(&self, envelope: &PeerEnvelope) -> Result<Option<ProcessOutcome>, OrderFlowError> {
        let message = match self.messenger.receive(envelope).await? {
            Inbound::Deliver(message) => message,
            Inbound::Duplicate => {
                self.messenger.acknowledge(envelope).await?;
                return Ok(None);
            },
            Inbound::Acked(_) => return Ok(None),
        };
        let result = self.process_message(message).await;
        if !matches!(result, Err(OrderFlowError::Store(_))) {
            self.messenger.acknowledge(envelope).await?;
        }
        result.map(Some)
    }

    pub(crate) async fn begin(&self) -> Result<Transition, OrderFlowError> {
        let tx = self.db.begin_update().await?;
        Ok(Transition { tx, acks: vec![] })
    }

    pub(crate) async fn apply_in_savepoint(
        &self,
        t: &mut Transition,
        message: &SignedOrderMessage,
    ) -> Result<(), OrderFlowError> {
        let savepoint = t.tx.savepoint().await?;
        let acks = t.acks.len();
        match self.apply(t, message).await {
            Ok(()) => {
                t.tx.release(savepoint).await?;
                Ok(())
            },
            Err(e) => {
                t.tx.rollback_to(savepoint).await?;
                t.acks.truncate(acks);
                Err(e)
            },
        }
    }

    async fn record_errored(
        &self,
        t: &mut Transition,
        order_id: &OrderId,
        kind: MessageKind,
        blob: &[u8],
        error: &OrderFlowError,
    ) -> Result<(), OrderFlowError> {
        parked::record_errored(order_id, kind, blob, &error.to_string(), t.tx.conn()).await?;
        self.emit(t, events::MessageErrored { order_id: order_id.clone(), kind, error: error.to_string() });
        Ok(())
    }

    /// Retries the order's parked messages in message-kind order until a pass makes no progress.
    pub(crate) async fn drain_parked(&self, t: &mut Transition, order_id: &OrderId) -> Result<(), OrderFlowError> {
        loop {
            let mut parked = parked::fetch_parked(order_id, t.tx.conn()).await?;
            if parked.is_empty() {
                return Ok(());
            }
            parked.sort_by_key(|p| p.kind);
            let mut progress = false;
            for entry in parked {
                let message = match SignedOrderMessage::from_blob(&entry.blob) {
                    Ok(m) => m,
                    Err(e) => {
                        parked::remove_parked(order_id, entry.kind, t.tx.conn()).await?;
                        self.record_errored(t, order_id, entry.kind, &entry.blob, &e.into()).await?;
                        continue;
                    },
                };
                match self.apply_in_savepoint(t, &message).await {
                    Ok(()) => {
                        info!("🔄️ Applied parked {} for order {order_id}", entry.kind);
                        parked::remove_parked(order_id, entry.kind, t.tx.conn()).await?;
                        progress = true;
                    },
                    Err(e) if e.is_parkable() => {
                        trace!("🔄️ Parked {} for order {order_id} still waits. {e}", entry.kind)
                    },
                    Err(e) if e.is_duplicate() => {
                        parked::remove_parked(order_id, entry.kind, t.tx.conn()).await?;
                    },
                    Err(e) => {
                        warn!("🔄️ Parked {} for order {order_id} was rejected. {e}", entry.kind);
                        parked::remove_parked(order_id, entry.kind, t.tx.conn()).await?;
                        self.record_errored(t, order_id, entry.kind, &entry.blob, &e).await?;
                    },
                }
            }
            if !progress {
                return Ok(());
            }
        }
    }

    //------------------------------------------   Shared plumbing   -------------------------------------------------

    /// Publishes `event` once the transition commits.
    pub(crate) fn emit<E: Into<DomainEvent>>(&self, t: &mut Transition, event: E) {
        let event = event.into();
        let bus = self.events.clone();
        t.tx.on_commit(move || bus.publish(event));
    }

    pub(crate) fn wallet_for(&self, coin: &str) -> Result<std::sync::Arc<dyn Wallet>, OrderFlowError> {
        Ok(self.wallets.wallet_for(coin)?)
    }

    pub(crate) fn escrow_for(&self, coin: &str) -> Result<EscrowCoordinator, OrderFlowError> {
        Ok(EscrowCoordinator::new(self.wallet_for(coin)?, self.identity.clone()))
    }

    pub(crate) async fn load(
        &self,
        t: &mut Transition,
        order_id: &OrderId,
    ) -> Result<(OrderRecord, OrderOpen), OrderFlowError> {
        let order = orders::fetch_order(order_id, t.tx.conn())
            .await?
            .ok_or_else(|| OrderFlowError::NotFound(order_id.clone()))?;
        let open = stored_open(&order)?;
        Ok((order, open))
    }

    /// Signs `message` as this node, stores it and queues it for the peers that should receive it.
    pub(crate) async fn send_own(
        &self,
        t: &mut Transition,
        order_id: &OrderId,
        open: &OrderOpen,
        message: OrderMessage,
    ) -> Result<SignedOrderMessage, OrderFlowError> {
        let kind = message.kind();
        let signed = SignedOrderMessage::sign(&self.identity, order_id.clone(), message)?;
        let blob = signed.to_blob()?;
        let seq = messages::fetch_messages(order_id, t.tx.conn())
            .await?
            .iter()
            .filter(|m| m.kind == kind)
            .map(|m| m.seq + 1)
            .max()
            .unwrap_or(0);
        messages::insert_message(order_id, kind, seq, &blob, t.tx.conn()).await?;
        for recipient in recipients(kind, open, self.peer_id()) {
            let ack = self.messenger.send_reliably(&mut t.tx, &recipient, &signed, seq).await?;
            t.acks.push(ack);
        }
        let me = open.role_of(self.peer_id());
        if let Some(event) = event_for(order_id, me, &signed.message, me) {
            self.emit(t, event);
        }
        debug!("🔄️ Sent {kind} for order {order_id}");
        Ok(signed)
    }
}

/// Who gets a message of `kind` written by `me`.
pub(crate) fn recipients(kind: MessageKind, open: &OrderOpen, me: &PeerId) -> Vec<PeerId> {
    let mut result = match kind {
        MessageKind::OrderOpen | MessageKind::OrderCancel | MessageKind::OrderComplete | MessageKind::PaymentSent => {
            open.vendor().into_iter().cloned().collect()
        },
        MessageKind::OrderReject |
        MessageKind::OrderConfirmation |
        MessageKind::RatingSignatures |
        MessageKind::OrderFulfillment |
        MessageKind::Refund => vec![open.buyer().clone()],
        MessageKind::DisputeUpdate => open.moderator().into_iter().cloned().collect(),
        MessageKind::DisputeOpen | MessageKind::DisputeClose | MessageKind::PaymentFinalized => open.counterparties(me),
    };
    result.retain(|p| p != me);
    result.dedup();
    result
}

/// The event a stored message announces. `PAYMENT_FINALIZED` is announced by whoever records the final spend.
pub(crate) fn event_for(order_id: &OrderId, me: Role, message: &OrderMessage, author: Role) -> Option<DomainEvent> {
    let order_id = order_id.clone();
    let event: DomainEvent = match message {
        OrderMessage::OrderOpen(open) => events::NewOrder {
            order_id,
            role: me,
            buyer: open.buyer().clone(),
            vendor: open.vendor()?.clone(),
            coin: open.payment.coin.clone(),
            amount: open.payment.amount.clone(),
        }
        .into(),
        OrderMessage::OrderReject(r) => events::OrderDeclined { order_id, reason: r.reason.clone() }.into(),
        OrderMessage::OrderCancel(_) => events::OrderCancel { order_id }.into(),
        OrderMessage::OrderConfirmation(_) => events::OrderConfirmation { order_id }.into(),
        OrderMessage::RatingSignatures(r) => {
            events::RatingSignaturesReceived { order_id, count: r.signatures.len() }.into()
        },
        OrderMessage::OrderFulfillment(f) => {
            events::OrderFulfillment { order_id, items: f.items.iter().map(|i| i.item_index).collect() }.into()
        },
        OrderMessage::OrderComplete(c) => events::OrderCompletion { order_id, ratings: c.ratings.len() }.into(),
        OrderMessage::DisputeOpen(d) => {
            events::DisputeOpen { order_id, opened_by: author, claim: d.claim.clone() }.into()
        },
        OrderMessage::DisputeUpdate(_) => events::DisputeUpdate { order_id, submitted_by: author }.into(),
        OrderMessage::DisputeClose(d) => {
            events::DisputeClose { order_id, resolution: d.resolution.clone() }.into()
        },
        OrderMessage::Refund(r) => events::Refund { order_id, txid: r.txid.clone() }.into(),
        OrderMessage::PaymentSent(p) => events::PaymentSent { order_id, txid: p.txid.clone() }.into(),
        OrderMessage::PaymentFinalized(_) => return None,
    };
    Some(event)
}

pub(crate) fn check_own(kind: MessageKind, order: &OrderRecord, open: &OrderOpen) -> Result<(), OrderFlowError> {
    lattice::check(kind, order.role, order, open)
}
