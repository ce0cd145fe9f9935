//! Local actions: everything the user of this node can do to an order.
//!
//! Each action runs as one transition. It is checked against the lattice with this node as the author, performs its
//! wallet work, then stores and queues the resulting message. Errors surface to the caller unchanged, and nothing
//! is stored or sent if the action fails.
use std::fmt::Debug;

use agora_common::Amount;
use chrono::Utc;
use futures_util::future::try_join_all;
use log::*;

use crate::{
    db_types::{MessageKind, OrderId, OrderRecord, PaymentMethod, PeerId, Role},
    escrow::{build_release, build_release_to, escrow_address, EscrowError, EscrowKeys},
    helpers::{sanitize, sanitize_text, ChainCode},
    messenger::AckToken,
    order_flow::{
        api::{check_own, event_for, recipients, Transition},
        handlers::{dispute_payout_address, vendor_payout_address},
        lattice::stored_messages,
        OrderFlowApi,
        OrderFlowError,
    },
    order_messages::{
        BuyerId,
        DisputeClose,
        DisputeOpen,
        DisputePayout,
        FulfilledItem,
        OrderCancel,
        OrderComplete,
        OrderConfirmation,
        OrderFulfillment,
        OrderItem,
        OrderMessage,
        OrderOpen,
        OrderReject,
        Payment,
        PaymentSent,
        PayoutOutput,
        Refund,
        ShippingAddress,
        SignedListing,
        SignedOrderMessage,
    },
    ratings::{rating_public_keys, sign_rating_keys, Rating, RatingScores, RatingSignature},
    traits::{TxOutput, WalletBatch, WalletError},
};

/// Version stamped into every `ORDER_OPEN` this node writes.
pub const ORDER_VERSION: u32 = 1;

/// The result of a local action. The messages it sent are already queued; `delivered` waits for their ACKs.
pub struct ActionOutcome {
    pub order_id: OrderId,
    /// The transaction the action broadcast, if any.
    pub txid: Option<String>,
    acks: Vec<AckToken>,
}

impl Debug for ActionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionOutcome")
            .field("order_id", &self.order_id)
            .field("txid", &self.txid)
            .field("pending_acks", &self.acks.len())
            .finish()
    }
}

impl ActionOutcome {
    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Resolves once every recipient has acknowledged. Dropping the outcome instead does not cancel delivery.
    pub async fn delivered(self) -> Result<(), OrderFlowError> {
        try_join_all(self.acks).await?;
        Ok(())
    }
}

/// The moderator a buyer picked, with the escrow master key it publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeratorInfo {
    pub peer_id: PeerId,
    pub escrow_key: String,
}

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub listings: Vec<SignedListing>,
    pub items: Vec<OrderItem>,
    pub shipping: Option<ShippingAddress>,
    pub method: PaymentMethod,
    pub moderator: Option<ModeratorInfo>,
    pub coin: String,
    /// Defaults to a fresh address from this node's wallet.
    pub refund_address: Option<String>,
    pub alternate_contact_info: String,
}

/// A buyer's review of one order item.
#[derive(Debug, Clone)]
pub struct ItemReview {
    pub scores: RatingScores,
    pub review: String,
}

/// How a moderator splits the escrow. Zero shares are left out of the payout.
#[derive(Debug, Clone, Default)]
pub struct DisputeSplit {
    pub buyer: Amount,
    pub vendor: Amount,
    pub moderator: Amount,
}

impl OrderFlowApi {
    /// Places an order with the vendor of `request.listings`.
    pub async fn purchase(&self, request: PurchaseRequest) -> Result<ActionOutcome, OrderFlowError> {
        let first = request
            .listings
            .first()
            .ok_or_else(|| OrderFlowError::bad_request("a purchase needs at least one listing"))?;
        let vendor = first.listing.vendor.clone();
        for listing in &request.listings {
            listing.verify()?;
            if listing.listing.vendor.peer_id != vendor.peer_id {
                return Err(OrderFlowError::bad_request("every listing must come from the same vendor"));
            }
        }
        let moderated = request.method == PaymentMethod::Moderated;
        match (&request.moderator, moderated) {
            (None, true) => return Err(OrderFlowError::bad_request("a moderated purchase needs a moderator")),
            (Some(_), false) => return Err(OrderFlowError::bad_request("only moderated purchases name a moderator")),
            _ => {},
        }
        let timeout_hours = if moderated { first.listing.metadata.escrow_timeout_hours } else { 0 };
        let amount = self.quote(&request.listings, &request.items, &request.coin).await?;
        let wallet = self.wallet_for(&request.coin)?;
        let chaincode = ChainCode::random();
        let moderator_key = request.moderator.as_ref().map(|m| m.escrow_key.clone());
        let keys = EscrowKeys::derive(&chaincode, &self.identity.keys(), &vendor.pubkeys, moderator_key.as_deref())?;
        let escrow = escrow_address(wallet.as_ref(), request.method, &keys, timeout_hours).await?;
        let threshold = if moderated { 2 } else { 1 };
        let escrow_release_fee = wallet.estimate_escrow_fee(threshold, self.config.fee_level).await?;
        let refund_address = match request.refund_address {
            Some(address) => address,
            None => wallet.new_address(None).await?,
        };
        let rating_keys = rating_public_keys(self.identity.rating_master(), &chaincode, request.items.len())?;
        let items = request
            .items
            .into_iter()
            .map(|item| OrderItem { memo: sanitize_text(&item.memo), ..item })
            .collect::<Vec<_>>();
        let shipping = request
            .shipping
            .map(|s| sanitize(&s))
            .transpose()
            .map_err(|e| OrderFlowError::bad_request(format!("invalid shipping address: {e}")))?;
        let open = OrderOpen {
            listings: request.listings,
            refund_address,
            shipping,
            buyer_id: BuyerId {
                peer_id: self.peer_id().clone(),
                handle: String::new(),
                pubkeys: self.identity.keys(),
                sig: self.identity.sign_escrow_key()?,
            },
            timestamp: Utc::now(),
            items,
            payment: Payment {
                method: request.method,
                moderator: request.moderator.map(|m| m.peer_id),
                amount,
                chaincode,
                address: escrow.address,
                redeem_script: hex::encode(&escrow.redeem_script),
                moderator_key,
                coin: request.coin,
                escrow_release_fee,
                escrow_timeout_hours: timeout_hours,
            },
            rating_keys,
            alternate_contact_info: sanitize_text(&request.alternate_contact_info),
            version: ORDER_VERSION,
        };
        let signed = SignedOrderMessage::open(&self.identity, open.clone())?;
        let order_id = signed.order_id.clone();
        let mut t = self.begin().await?;
        self.create_order(&mut t, &order_id, &open, Role::Buyer, &signed.to_blob()?).await?;
        for recipient in recipients(MessageKind::OrderOpen, &open, self.peer_id()) {
            let ack = self.messenger.send_reliably(&mut t.tx, &recipient, &signed, 0).await?;
            t.acks.push(ack);
        }
        if let Some(event) = event_for(&order_id, Role::Buyer, &signed.message, Role::Buyer) {
            self.emit(&mut t, event);
        }
        info!("🔄️ Placed order {order_id} for {} {} ({})", open.payment.amount, open.payment.coin, open.payment.method);
        self.conclude(t, &order_id, None).await
    }

    /// Pays whatever is still owed on an order from this node's wallet, and tells the vendor.
    pub async fn pay(&self, order_id: &OrderId) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        check_own(MessageKind::PaymentSent, &order, &open)?;
        let due = order.payment_amount.clone() - order.funding_total();
        if !due.is_positive() {
            return Err(OrderFlowError::bad_request(format!("order {order_id} is already paid")));
        }
        let wallet = self.wallet_for(&order.payment_coin)?;
        let mut batch = WalletBatch::new();
        let txid = wallet.spend(&mut batch, &order.payment_address, &due, self.config.fee_level).await?;
        self.broadcast(&mut t, order_id, &order.payment_coin, batch, &txid).await?;
        info!("🔄️ Paid {due} {} for order {order_id} in {txid}", order.payment_coin);
        let message = OrderMessage::PaymentSent(PaymentSent { timestamp: Utc::now(), txid: txid.clone() });
        self.send_own(&mut t, order_id, &open, message).await?;
        self.conclude(t, order_id, Some(txid)).await
    }

    /// Tells the vendor about a payment made from outside this node's wallet.
    pub async fn notify_payment(&self, order_id: &OrderId, txid: &str) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        check_own(MessageKind::PaymentSent, &order, &open)?;
        self.record_txid(&mut t, &order, Some(txid), true).await?;
        let message = OrderMessage::PaymentSent(PaymentSent { timestamp: Utc::now(), txid: txid.to_string() });
        self.send_own(&mut t, order_id, &open, message).await?;
        self.conclude(t, order_id, Some(txid.to_string())).await
    }

    /// Buyer: withdraws a cancelable order and sweeps the escrow back to the refund address.
    pub async fn cancel(&self, order_id: &OrderId) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        check_own(MessageKind::OrderCancel, &order, &open)?;
        let refund_txid = self.sweep(&mut t, &order, &open, &open.refund_address).await?;
        let message =
            OrderMessage::OrderCancel(OrderCancel { timestamp: Utc::now(), refund_txid: refund_txid.clone() });
        self.send_own(&mut t, order_id, &open, message).await?;
        self.conclude(t, order_id, refund_txid).await
    }

    /// Vendor: accepts an order. Direct and cancelable orders carry the rating signatures here, and any funds already
    /// in their escrow are swept to this node's wallet.
    pub async fn confirm(&self, order_id: &OrderId) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        check_own(MessageKind::OrderConfirmation, &order, &open)?;
        let (rating_signatures, payout_txid) = match order.payment_method {
            PaymentMethod::Moderated => (vec![], None),
            PaymentMethod::Direct | PaymentMethod::Cancelable => {
                let signatures = sign_rating_keys(&self.identity, &open)?;
                let payout = self.own_payout_address(&order, &open).await?;
                (signatures, self.sweep(&mut t, &order, &open, &payout).await?)
            },
        };
        let message = OrderMessage::OrderConfirmation(OrderConfirmation {
            timestamp: Utc::now(),
            rating_signatures,
            payout_txid: payout_txid.clone(),
        });
        self.send_own(&mut t, order_id, &open, message).await?;
        self.conclude(t, order_id, payout_txid).await
    }

    /// Vendor: declines an order. Funds a vendor can move alone go straight back to the buyer. A funded moderated
    /// order needs a `refund` as well.
    pub async fn reject(&self, order_id: &OrderId, reason: &str) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        check_own(MessageKind::OrderReject, &order, &open)?;
        let txid = match order.payment_method {
            PaymentMethod::Moderated => None,
            _ => self.sweep(&mut t, &order, &open, &open.refund_address).await?,
        };
        let message = OrderMessage::OrderReject(OrderReject { timestamp: Utc::now(), reason: sanitize_text(reason) });
        self.send_own(&mut t, order_id, &open, message).await?;
        self.conclude(t, order_id, txid).await
    }

    /// Vendor: ships some or all of the order's items.
    pub async fn fulfill(
        &self,
        order_id: &OrderId,
        items: Vec<FulfilledItem>,
        note: &str,
    ) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        check_own(MessageKind::OrderFulfillment, &order, &open)?;
        if items.is_empty() {
            return Err(OrderFlowError::bad_request("a fulfillment must cover at least one item"));
        }
        if let Some(item) = items.iter().find(|i| i.item_index as usize >= open.items.len()) {
            return Err(OrderFlowError::bad_request(format!("the order has no item {}", item.item_index)));
        }
        let items = items
            .iter()
            .map(sanitize)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| OrderFlowError::bad_request(e.to_string()))?;
        let (payout_address, txid) = match order.payment_method {
            PaymentMethod::Moderated => (Some(self.own_payout_address(&order, &open).await?), None),
            PaymentMethod::Direct | PaymentMethod::Cancelable => {
                let payout = self.own_payout_address(&order, &open).await?;
                (None, self.sweep(&mut t, &order, &open, &payout).await?)
            },
        };
        let message = OrderMessage::OrderFulfillment(OrderFulfillment {
            timestamp: Utc::now(),
            items,
            note: sanitize_text(note),
            payout_address,
        });
        self.send_own(&mut t, order_id, &open, message).await?;
        self.conclude(t, order_id, txid).await
    }

    /// Buyer: closes a fulfilled order, optionally rating its items. A moderated escrow is released to the vendor's
    /// payout address with this node's signatures.
    pub async fn complete(
        &self,
        order_id: &OrderId,
        reviews: Vec<ItemReview>,
        anonymous: bool,
    ) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        check_own(MessageKind::OrderComplete, &order, &open)?;
        if reviews.len() > open.items.len() {
            return Err(OrderFlowError::bad_request(format!("the order has only {} items", open.items.len())));
        }
        let vendor_signatures = vendor_rating_signatures(&order)?;
        let ratings = reviews
            .iter()
            .enumerate()
            .map(|(index, review)| {
                let vendor_sig = vendor_signatures
                    .get(index)
                    .cloned()
                    .ok_or_else(|| OrderFlowError::missing(MessageKind::OrderComplete, "RATING_SIGNATURES"))?;
                let text = sanitize_text(&review.review);
                Ok(Rating::create(&self.identity, &open, index, vendor_sig, review.scores, &text, anonymous)?)
            })
            .collect::<Result<Vec<_>, OrderFlowError>>()?;
        let release = if order.payment_method == PaymentMethod::Moderated && !order.escrow_balance().is_zero() {
            let payout = vendor_payout_address(&order)?
                .ok_or_else(|| OrderFlowError::missing(MessageKind::OrderComplete, "vendor payout address"))?;
            let escrow = self.escrow_for(&order.payment_coin)?;
            let txn = build_release_to(&order, &payout, &open.payment.escrow_release_fee, escrow.wallet())?;
            Some(escrow.sign(&open, txn).await?)
        } else {
            None
        };
        let message = OrderMessage::OrderComplete(OrderComplete { timestamp: Utc::now(), ratings, release });
        self.send_own(&mut t, order_id, &open, message).await?;
        self.conclude(t, order_id, None).await
    }

    /// Buyer or vendor: asks the order's moderator to decide. The moderator first gets the `ORDER_OPEN`, which it has
    /// never seen.
    pub async fn open_dispute(&self, order_id: &OrderId, claim: &str) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        check_own(MessageKind::DisputeOpen, &order, &open)?;
        let moderator = open.moderator().ok_or_else(|| OrderFlowError::bad_request("the order has no moderator"))?;
        let original = stored_messages(&order, MessageKind::OrderOpen)?
            .into_iter()
            .next()
            .ok_or_else(|| OrderFlowError::missing(MessageKind::DisputeOpen, "ORDER_OPEN"))?;
        let ack = self.messenger.send_reliably(&mut t.tx, moderator, &original, 0).await?;
        t.acks.push(ack);
        let payout_address = self.own_payout_address(&order, &open).await?;
        let message = OrderMessage::DisputeOpen(DisputeOpen {
            timestamp: Utc::now(),
            claim: sanitize_text(claim),
            opened_by: order.role,
            payout_address,
        });
        self.send_own(&mut t, order_id, &open, message).await?;
        info!("🔄️ Opened a dispute on order {order_id} with moderator {}", moderator.short());
        self.conclude(t, order_id, None).await
    }

    /// Moderator: settles a dispute. The release carries this node's signatures; whichever party finishes it first
    /// broadcasts it.
    pub async fn close_dispute(
        &self,
        order_id: &OrderId,
        split: DisputeSplit,
        resolution: &str,
    ) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        check_own(MessageKind::DisputeClose, &order, &open)?;
        if order.escrow_balance().is_zero() {
            return Err(OrderFlowError::bad_request(format!("the escrow of order {order_id} is empty")));
        }
        let buyer_address = match dispute_payout_address(&order, &open, Role::Buyer)? {
            Some(address) => address,
            None => open.refund_address.clone(),
        };
        let vendor_address = if split.vendor.is_positive() {
            dispute_payout_address(&order, &open, Role::Vendor)?
                .ok_or_else(|| OrderFlowError::missing(MessageKind::DisputeClose, "vendor payout address"))?
        } else {
            String::new()
        };
        let moderator_address = if split.moderator.is_positive() {
            self.own_payout_address(&order, &open).await?
        } else {
            String::new()
        };
        let shares =
            [(buyer_address, split.buyer), (vendor_address, split.vendor), (moderator_address, split.moderator)];
        let payouts = shares
            .iter()
            .filter(|(_, amount)| amount.is_positive())
            .map(|(address, amount)| TxOutput { address: address.clone(), amount: amount.clone() })
            .collect::<Vec<_>>();
        let escrow = self.escrow_for(&order.payment_coin)?;
        let txn = build_release(&order, payouts, escrow.wallet())?;
        let payout_for = |address: &str| {
            txn.outputs
                .iter()
                .find(|o| !address.is_empty() && o.address == address)
                .map(|o| PayoutOutput { address: o.address.clone(), amount: o.amount.clone() })
        };
        let payout = DisputePayout {
            buyer: payout_for(&shares[0].0),
            vendor: payout_for(&shares[1].0),
            moderator: payout_for(&shares[2].0),
        };
        info!("🔄️ Settling order {order_id}: {payout:?}, fee {}", txn.fee());
        let release = escrow.sign(&open, txn).await?;
        let message = OrderMessage::DisputeClose(DisputeClose {
            timestamp: Utc::now(),
            resolution: sanitize_text(resolution),
            payout,
            release,
        });
        self.send_own(&mut t, order_id, &open, message).await?;
        self.conclude(t, order_id, None).await
    }

    /// Vendor: gives the buyer their money back. Direct orders are refunded from this node's wallet (or straight
    /// from the escrow, if it still holds funds). Moderated refunds are half a release that the buyer finishes.
    pub async fn refund(&self, order_id: &OrderId) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        check_own(MessageKind::Refund, &order, &open)?;
        let (txid, release) = match order.payment_method {
            PaymentMethod::Moderated => {
                if order.escrow_balance().is_zero() {
                    return Err(OrderFlowError::bad_request(format!("the escrow of order {order_id} is empty")));
                }
                let escrow = self.escrow_for(&order.payment_coin)?;
                let fee = &open.payment.escrow_release_fee;
                let txn = build_release_to(&order, &open.refund_address, fee, escrow.wallet())?;
                (None, Some(escrow.sign(&open, txn).await?))
            },
            _ if !order.escrow_balance().is_zero() => {
                (self.sweep(&mut t, &order, &open, &open.refund_address).await?, None)
            },
            _ => {
                let amount = order.funding_total();
                if !amount.is_positive() {
                    return Err(OrderFlowError::bad_request(format!("order {order_id} was never paid")));
                }
                let wallet = self.wallet_for(&order.payment_coin)?;
                let mut batch = WalletBatch::new();
                let txid = wallet.spend(&mut batch, &open.refund_address, &amount, self.config.fee_level).await?;
                self.broadcast(&mut t, order_id, &order.payment_coin, batch, &txid).await?;
                (Some(txid), None)
            },
        };
        let message = OrderMessage::Refund(Refund { timestamp: Utc::now(), txid: txid.clone(), release });
        self.send_own(&mut t, order_id, &open, message).await?;
        self.conclude(t, order_id, txid).await
    }

    /// Vendor: claims a moderated escrow alone once its time lock has expired. Fails with
    /// [`WalletError::TimeLocked`] before then.
    pub async fn release_funds_after_timeout(&self, order_id: &OrderId) -> Result<ActionOutcome, OrderFlowError> {
        let mut t = self.begin().await?;
        let (order, open) = self.load(&mut t, order_id).await?;
        if order.role != Role::Vendor || order.payment_method != PaymentMethod::Moderated {
            return Err(OrderFlowError::bad_request("only the vendor of a moderated order can claim after a timeout"));
        }
        if open.payment.escrow_timeout_hours == 0 {
            return Err(OrderFlowError::bad_request(format!("the escrow of order {order_id} has no time lock")));
        }
        check_own(MessageKind::PaymentFinalized, &order, &open)?;
        if order.escrow_balance().is_zero() {
            return Err(OrderFlowError::bad_request(format!("the escrow of order {order_id} is empty")));
        }
        let payout = self.own_payout_address(&order, &open).await?;
        let txid = self
            .sweep(&mut t, &order, &open, &payout)
            .await?
            .ok_or_else(|| OrderFlowError::bad_request("the escrow was released while claiming it"))?;
        self.announce_finalized(&mut t, order_id, &open, txid.clone()).await?;
        self.conclude(t, order_id, Some(txid)).await
    }

    //------------------------------------------   Helpers   ---------------------------------------------------------

    /// Spends the whole escrow to `to` on this node's signature alone. Returns `None` if the escrow is empty or
    /// someone else's spend got there first.
    async fn sweep(
        &self,
        t: &mut Transition,
        order: &OrderRecord,
        open: &OrderOpen,
        to: &str,
    ) -> Result<Option<String>, OrderFlowError> {
        if order.escrow_balance().is_zero() {
            return Ok(None);
        }
        let escrow = self.escrow_for(&order.payment_coin)?;
        let txn = build_release_to(order, to, &open.payment.escrow_release_fee, escrow.wallet())?;
        let mut batch = WalletBatch::new();
        let txid = match escrow.release_alone(&mut batch, open, txn).await {
            Ok(txid) => txid,
            Err(EscrowError::Wallet(WalletError::AlreadySpent)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let sent = self.broadcast(t, &order.order_id, &order.payment_coin, batch, &txid).await?;
        Ok(sent.then_some(txid))
    }

    async fn conclude(
        &self,
        mut t: Transition,
        order_id: &OrderId,
        txid: Option<String>,
    ) -> Result<ActionOutcome, OrderFlowError> {
        self.refresh(&mut t, order_id).await?;
        self.drain_parked(&mut t, order_id).await?;
        let Transition { tx, acks } = t;
        tx.commit().await?;
        Ok(ActionOutcome { order_id: order_id.clone(), txid, acks })
    }
}

/// The vendor's rating signatures: from `RATING_SIGNATURES` for moderated orders, from the confirmation otherwise.
fn vendor_rating_signatures(order: &OrderRecord) -> Result<Vec<RatingSignature>, OrderFlowError> {
    for message in stored_messages(order, MessageKind::RatingSignatures)? {
        if let OrderMessage::RatingSignatures(r) = message.message {
            return Ok(r.signatures);
        }
    }
    for message in stored_messages(order, MessageKind::OrderConfirmation)? {
        if let OrderMessage::OrderConfirmation(c) = message.message {
            return Ok(c.rating_signatures);
        }
    }
    Ok(vec![])
}
