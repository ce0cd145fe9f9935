//! Inbound message handling: one arm per message kind.
use chrono::Utc;
use log::*;

use crate::{
    db::sqlite::{messages, orders, orders::NewOrderRecord},
    db_types::{MessageKind, OrderId, OrderRecord, OrderState, PaymentMethod, Role},
    escrow::{check_release, distribute, verify_escrow_address, EscrowError, ReleaseInfo},
    order_flow::{
        api::{event_for, Transition},
        lattice::{self, fulfillments, stored_messages, stored_open},
        validation::{check_order_open, check_payment_amount, order_totals, payment_due},
        OrderFlowApi,
        OrderFlowError,
    },
    order_messages::{
        DisputeClose,
        DisputeUpdate,
        OrderComplete,
        OrderConfirmation,
        OrderMessage,
        OrderOpen,
        PaymentFinalized,
        Refund,
        SignedOrderMessage,
    },
    ratings::{verify_rating, verify_rating_signatures, RatingIndex},
    traits::{TxOutput, WalletBatch, WalletError},
};

/// Work that can only happen once the inbound message itself is stored.
enum FollowUp {
    None,
    /// This node broadcast the final spend of the escrow.
    Finalized(String),
    /// A counterparty opened a dispute. Tell the moderator our side.
    AnswerDispute,
}

impl OrderFlowApi {
    /// Checks and applies one inbound message inside the caller's transition.
    pub(crate) async fn apply(&self, t: &mut Transition, signed: &SignedOrderMessage) -> Result<(), OrderFlowError> {
        let kind = signed.kind();
        let blob = signed.to_blob()?;
        let existing = orders::fetch_order(&signed.order_id, t.tx.conn()).await?;
        let order = match (existing, &signed.message) {
            (None, OrderMessage::OrderOpen(open)) => return self.accept_order(t, signed, open, &blob).await,
            (None, _) => return Err(OrderFlowError::missing(kind, "ORDER_OPEN")),
            (Some(order), _) => order,
        };
        let seq = classify(&order, kind, &blob)?;
        let open = stored_open(&order)?;
        let author = open.role_of(&signed.sender);
        lattice::check(kind, author, &order, &open)?;
        let follow_up = match &signed.message {
            OrderMessage::OrderOpen(_) => return Err(OrderFlowError::ChangedMessage(kind)),
            OrderMessage::OrderReject(_) | OrderMessage::DisputeUpdate(_) => FollowUp::None,
            OrderMessage::OrderCancel(cancel) => {
                self.record_txid(t, &order, cancel.refund_txid.as_deref(), false).await?;
                FollowUp::None
            },
            OrderMessage::OrderConfirmation(confirmation) => {
                self.on_confirmation(t, &order, &open, confirmation).await?
            },
            OrderMessage::RatingSignatures(r) => {
                verify_rating_signatures(&open, &r.signatures)?;
                FollowUp::None
            },
            OrderMessage::OrderFulfillment(f) => {
                if f.items.is_empty() {
                    return Err(OrderFlowError::bad_request("a fulfillment must cover at least one item"));
                }
                if let Some(item) = f.items.iter().find(|i| i.item_index as usize >= open.items.len()) {
                    return Err(OrderFlowError::bad_request(format!("the order has no item {}", item.item_index)));
                }
                FollowUp::None
            },
            OrderMessage::OrderComplete(complete) => self.on_complete(t, &order, &open, complete).await?,
            OrderMessage::DisputeOpen(_) => match order.role {
                Role::Buyer | Role::Vendor if author != order.role => FollowUp::AnswerDispute,
                _ => FollowUp::None,
            },
            OrderMessage::DisputeClose(close) => self.on_dispute_close(t, &order, &open, close).await?,
            OrderMessage::Refund(refund) => self.on_refund(t, &order, &open, refund).await?,
            OrderMessage::PaymentSent(sent) => {
                self.record_txid(t, &order, Some(&sent.txid), true).await?;
                FollowUp::None
            },
            OrderMessage::PaymentFinalized(finalized) => {
                self.on_payment_finalized(t, &order, finalized).await?;
                FollowUp::None
            },
        };
        messages::insert_message(&order.order_id, kind, seq, &blob, t.tx.conn()).await?;
        if let Some(event) = event_for(&order.order_id, order.role, &signed.message, author) {
            self.emit(t, event);
        }
        info!("🔄️ Applied {kind} from the {author} to order {}", order.order_id);
        match follow_up {
            FollowUp::None => {},
            FollowUp::Finalized(txid) => self.announce_finalized(t, &order.order_id, &open, txid).await?,
            FollowUp::AnswerDispute => self.answer_dispute(t, &order, &open).await?,
        }
        self.refresh(t, &order.order_id).await
    }

    /// `ORDER_OPEN` from the buyer: creates the order on a vendor or moderator node.
    async fn accept_order(
        &self,
        t: &mut Transition,
        signed: &SignedOrderMessage,
        open: &OrderOpen,
        blob: &[u8],
    ) -> Result<(), OrderFlowError> {
        let kind = MessageKind::OrderOpen;
        let author = open.role_of(&signed.sender);
        if author != Role::Buyer {
            return Err(OrderFlowError::unexpected(kind, format!("cannot be sent by the {author}")));
        }
        let role = open.role_of(self.peer_id());
        let wallet = self.wallet_for(&open.payment.coin)?;
        match role {
            Role::Vendor => {
                check_order_open(open, &self.identity, self.rates.dictionary())?;
                verify_escrow_address(wallet.as_ref(), open).await?;
                let dictionary = self.rates.dictionary();
                let totals = order_totals(&open.listings, &open.items, dictionary)?;
                let coin = dictionary.lookup(&open.payment.coin)?;
                let (due, exact) = payment_due(&self.rates, &totals, &coin).await?;
                check_payment_amount(&open.payment.amount, &due, exact, &self.config.price_tolerance)?;
            },
            Role::Moderator => {
                if open.payment.method != PaymentMethod::Moderated {
                    return Err(OrderFlowError::unexpected(kind, "moderators only take part in moderated orders"));
                }
                verify_escrow_address(wallet.as_ref(), open).await?;
            },
            Role::Buyer => debug!("🔄️ Restoring our own order {}", signed.order_id),
            Role::Unknown => return Err(OrderFlowError::bad_request("the order does not involve this node")),
        }
        self.create_order(t, &signed.order_id, open, role, blob).await?;
        if let Some(event) = event_for(&signed.order_id, role, &signed.message, author) {
            self.emit(t, event);
        }
        info!("🔄️ New order {} as {role}: {} {}", signed.order_id, open.payment.amount, open.payment.coin);
        self.refresh(t, &signed.order_id).await
    }

    /// Stores a new order with its `ORDER_OPEN`, watches its payment address and records payments already made.
    pub(crate) async fn create_order(
        &self,
        t: &mut Transition,
        order_id: &OrderId,
        open: &OrderOpen,
        role: Role,
        blob: &[u8],
    ) -> Result<(), OrderFlowError> {
        if open.vendor().is_none() {
            return Err(OrderFlowError::bad_request("the order has no listings"));
        }
        let record = NewOrderRecord {
            order_id: order_id.clone(),
            role,
            state: OrderState::AwaitingPayment,
            payment_method: open.payment.method,
            payment_coin: open.payment.coin.clone(),
            payment_address: open.payment.address.clone(),
            payment_amount: open.payment.amount.clone(),
        };
        orders::insert_order(&record, t.tx.conn()).await?;
        messages::insert_message(order_id, MessageKind::OrderOpen, 0, blob, t.tx.conn()).await?;
        let wallet = self.wallet_for(&open.payment.coin)?;
        let mut batch = WalletBatch::new();
        wallet.watch_address(&mut batch, &open.payment.address).await?;
        wallet.commit(batch).await?;
        for wtx in wallet.transactions_for_address(&open.payment.address).await? {
            self.record_transaction(t, order_id, &wtx).await?;
        }
        Ok(())
    }

    async fn on_confirmation(
        &self,
        t: &mut Transition,
        order: &OrderRecord,
        open: &OrderOpen,
        confirmation: &OrderConfirmation,
    ) -> Result<FollowUp, OrderFlowError> {
        if order.payment_method != PaymentMethod::Moderated {
            verify_rating_signatures(open, &confirmation.rating_signatures)?;
        }
        self.record_txid(t, order, confirmation.payout_txid.as_deref(), false).await?;
        Ok(FollowUp::None)
    }

    /// Vendor side: index the buyer's ratings and, for a moderated order, finish the buyer's escrow release.
    async fn on_complete(
        &self,
        t: &mut Transition,
        order: &OrderRecord,
        open: &OrderOpen,
        complete: &OrderComplete,
    ) -> Result<FollowUp, OrderFlowError> {
        for rating in &complete.ratings {
            verify_rating(open, rating)?;
        }
        if order.role == Role::Vendor {
            for rating in &complete.ratings {
                RatingIndex::add_rating(&mut t.tx, rating).await?;
            }
        }
        if order.payment_method != PaymentMethod::Moderated || order.role != Role::Vendor {
            return Ok(FollowUp::None);
        }
        let release = match &complete.release {
            Some(release) => release,
            None if order.escrow_balance().is_zero() => return Ok(FollowUp::None),
            None => return Err(OrderFlowError::bad_request("a moderated completion must release the escrow")),
        };
        let payout = vendor_payout_address(order)?
            .ok_or_else(|| OrderFlowError::unexpected(MessageKind::OrderComplete, "no payout address was given"))?;
        let amount = order.escrow_balance() - open.payment.escrow_release_fee.clone();
        let expected = vec![TxOutput { address: payout, amount }];
        self.finish_release(t, order, open, release, expected).await
    }

    async fn on_dispute_close(
        &self,
        t: &mut Transition,
        order: &OrderRecord,
        open: &OrderOpen,
        close: &DisputeClose,
    ) -> Result<FollowUp, OrderFlowError> {
        if order.role == Role::Moderator {
            return Ok(FollowUp::None);
        }
        let expected = [&close.payout.buyer, &close.payout.vendor, &close.payout.moderator]
            .into_iter()
            .flatten()
            .map(|p| TxOutput { address: p.address.clone(), amount: p.amount.clone() })
            .collect::<Vec<_>>();
        self.finish_release(t, order, open, &close.release, expected).await
    }

    /// Buyer side of a refund. Direct refunds arrive as a transaction, moderated ones as half a release.
    async fn on_refund(
        &self,
        t: &mut Transition,
        order: &OrderRecord,
        open: &OrderOpen,
        refund: &Refund,
    ) -> Result<FollowUp, OrderFlowError> {
        if order.role != Role::Buyer {
            return Ok(FollowUp::None);
        }
        match (&refund.release, order.payment_method) {
            (Some(release), PaymentMethod::Moderated) => {
                let amount = order.escrow_balance() - open.payment.escrow_release_fee.clone();
                let expected = vec![TxOutput { address: open.refund_address.clone(), amount }];
                self.finish_release(t, order, open, release, expected).await
            },
            (None, PaymentMethod::Moderated) if !order.escrow_balance().is_zero() => {
                Err(OrderFlowError::bad_request("a moderated refund must release the escrow"))
            },
            _ => {
                self.record_txid(t, order, refund.txid.as_deref(), false).await?;
                Ok(FollowUp::None)
            },
        }
    }

    async fn on_payment_finalized(
        &self,
        t: &mut Transition,
        order: &OrderRecord,
        finalized: &PaymentFinalized,
    ) -> Result<(), OrderFlowError> {
        let wallet = self.wallet_for(&order.payment_coin)?;
        match wallet.get_transaction(&finalized.txid).await? {
            Some(wtx) => {
                self.record_transaction(t, &order.order_id, &wtx).await?;
            },
            None => {
                debug!("🔄️ Final payment {} for order {} is not in our wallet", finalized.txid, order.order_id);
                self.emit(t, crate::events::PaymentFinalized {
                    order_id: order.order_id.clone(),
                    txid: finalized.txid.clone(),
                });
            },
        }
        Ok(())
    }

    /// Checks a counterparty's release against the payout we expect, adds our signatures and broadcasts it.
    ///
    /// Returns `FollowUp::None` if there is nothing left in the escrow, or if another party's release won the race.
    async fn finish_release(
        &self,
        t: &mut Transition,
        order: &OrderRecord,
        open: &OrderOpen,
        release: &ReleaseInfo,
        expected: Vec<TxOutput>,
    ) -> Result<FollowUp, OrderFlowError> {
        if order.escrow_balance().is_zero() {
            debug!("🔄️ The escrow of order {} is already empty", order.order_id);
            return Ok(FollowUp::None);
        }
        let escrow = self.escrow_for(&order.payment_coin)?;
        let (expected, _) = distribute(expected, |a| escrow.wallet().is_dust(a));
        check_release(order, release, &expected)?;
        let mut batch = WalletBatch::new();
        let txid = match escrow.finish(&mut batch, open, release).await {
            Ok(txid) => txid,
            Err(EscrowError::Wallet(WalletError::AlreadySpent)) => {
                info!("🔄️ The escrow of order {} was already released", order.order_id);
                return Ok(FollowUp::None);
            },
            Err(e) => return Err(e.into()),
        };
        if self.broadcast(t, &order.order_id, &order.payment_coin, batch, &txid).await? {
            Ok(FollowUp::Finalized(txid))
        } else {
            Ok(FollowUp::None)
        }
    }

    /// Sends `PAYMENT_FINALIZED` for a spend this node broadcast.
    pub(crate) async fn announce_finalized(
        &self,
        t: &mut Transition,
        order_id: &OrderId,
        open: &OrderOpen,
        txid: String,
    ) -> Result<(), OrderFlowError> {
        let order = orders::fetch_order(order_id, t.tx.conn())
            .await?
            .ok_or_else(|| OrderFlowError::NotFound(order_id.clone()))?;
        if order.has(MessageKind::PaymentFinalized) {
            return Ok(());
        }
        let message = OrderMessage::PaymentFinalized(PaymentFinalized { timestamp: Utc::now(), txid });
        self.send_own(t, order_id, open, message).await?;
        Ok(())
    }

    /// The counterparty's half of a dispute: our payout address, sent to the moderator.
    async fn answer_dispute(
        &self,
        t: &mut Transition,
        order: &OrderRecord,
        open: &OrderOpen,
    ) -> Result<(), OrderFlowError> {
        if order.has(MessageKind::DisputeUpdate) {
            return Ok(());
        }
        let payout_address = self.own_payout_address(order, open).await?;
        let message = OrderMessage::DisputeUpdate(DisputeUpdate {
            timestamp: Utc::now(),
            claim: String::new(),
            submitted_by: order.role,
            payout_address,
        });
        self.send_own(t, &order.order_id, open, message).await?;
        Ok(())
    }

    /// Where this node wants its share of an escrow paid.
    pub(crate) async fn own_payout_address(
        &self,
        order: &OrderRecord,
        open: &OrderOpen,
    ) -> Result<String, OrderFlowError> {
        match order.role {
            Role::Buyer => Ok(open.refund_address.clone()),
            _ => {
                let wallet = self.wallet_for(&order.payment_coin)?;
                Ok(wallet.new_address(Some(&order.order_id)).await?)
            },
        }
    }
}

/// A message is new, a byte-equal duplicate, or (for kinds that occur once) a conflicting second version.
/// Returns the sequence number a new message is stored under.
fn classify(order: &OrderRecord, kind: MessageKind, blob: &[u8]) -> Result<i64, OrderFlowError> {
    let mut stored = order.messages_of(kind);
    if kind.allows_multiple() {
        if stored.any(|m| m.blob == blob) {
            return Err(OrderFlowError::DuplicateMessage(kind));
        }
        return Ok(order.next_seq(kind));
    }
    match stored.next() {
        Some(m) if m.blob == blob => Err(OrderFlowError::DuplicateMessage(kind)),
        Some(_) => Err(OrderFlowError::ChangedMessage(kind)),
        None => Ok(0),
    }
}

/// The latest payout address the vendor gave in a fulfillment.
pub(crate) fn vendor_payout_address(order: &OrderRecord) -> Result<Option<String>, OrderFlowError> {
    Ok(fulfillments(order)?.into_iter().rev().find_map(|f| f.payout_address))
}

/// The payout address `role` gave during a dispute, if any.
pub(crate) fn dispute_payout_address(
    order: &OrderRecord,
    open: &OrderOpen,
    role: Role,
) -> Result<Option<String>, OrderFlowError> {
    let mut found = None;
    for kind in [MessageKind::DisputeOpen, MessageKind::DisputeUpdate] {
        for message in stored_messages(order, kind)? {
            if open.role_of(&message.sender) != role {
                continue;
            }
            match message.message {
                OrderMessage::DisputeOpen(d) => found = Some(d.payout_address),
                OrderMessage::DisputeUpdate(d) => found = Some(d.payout_address),
                _ => {},
            }
        }
    }
    Ok(found)
}
