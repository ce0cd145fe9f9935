use chrono::Utc;
use log::*;

use crate::{
    db::sqlite::{orders, orders::OrderQueryFilter, transactions},
    db_types::{MessageKind, OrderId, OrderRecord, PaymentMethod, Role, WalletTransaction},
    events,
    order_flow::{
        api::Transition,
        lattice::{derive_state, is_funded},
        OrderFlowApi,
        OrderFlowError,
    },
    order_messages::{OrderMessage, RatingSignatures},
    ratings::sign_rating_keys,
    traits::{WalletBatch, WalletError},
};

impl OrderFlowApi {
    /// Applies a wallet transaction to every order whose payment address it touches. Returns the orders that had not
    /// seen the transaction before.
    pub async fn process_transaction(
        &self,
        coin: &str,
        transaction: WalletTransaction,
    ) -> Result<Vec<OrderId>, OrderFlowError> {
        let mut t = self.begin().await?;
        let ids = orders::order_ids_for_addresses(&transaction.addresses(), t.tx.conn()).await?;
        let mut updated = Vec::with_capacity(ids.len());
        for order_id in ids {
            let Some(order) = orders::fetch_order(&order_id, t.tx.conn()).await? else {
                continue;
            };
            if !order.payment_coin.eq_ignore_ascii_case(coin) {
                trace!("🔄️ Order {order_id} is paid in {}. Ignoring {coin} transaction", order.payment_coin);
                continue;
            }
            if self.record_transaction(&mut t, &order_id, &transaction).await? {
                self.refresh(&mut t, &order_id).await?;
                self.drain_parked(&mut t, &order_id).await?;
                updated.push(order_id);
            }
        }
        t.tx.commit().await?;
        Ok(updated)
    }

    /// Re-reads the chain history of every open `coin` order's payment address and applies anything the order has not
    /// seen. The wallet worker calls this when its transaction subscription lagged and dropped notifications.
    pub async fn rescan_open_orders(&self, coin: &str) -> Result<Vec<OrderId>, OrderFlowError> {
        let wallet = self.wallet_for(coin)?;
        let open = self
            .search_orders(OrderQueryFilter::default())
            .await?
            .into_iter()
            .filter(|o| o.payment_coin.eq_ignore_ascii_case(coin) && !o.state.is_terminal())
            .collect::<Vec<_>>();
        debug!("🔄️ Rescanning {} open {coin} orders", open.len());
        let mut updated = Vec::new();
        for order in open {
            for transaction in wallet.transactions_for_address(&order.payment_address).await? {
                for id in self.process_transaction(coin, transaction).await? {
                    if !updated.contains(&id) {
                        updated.push(id);
                    }
                }
            }
        }
        if !updated.is_empty() {
            info!("🔄️ Rescan of {coin} payment addresses caught up {} orders", updated.len());
        }
        Ok(updated)
    }

    /// Records `transaction` against an order. Returns false if it was already recorded, in which case only its
    /// confirmation height is brought up to date.
    pub(crate) async fn record_transaction(
        &self,
        t: &mut Transition,
        order_id: &OrderId,
        transaction: &WalletTransaction,
    ) -> Result<bool, OrderFlowError> {
        if !transactions::insert_transaction(order_id, transaction, t.tx.conn()).await? {
            if transaction.height > 0 {
                transactions::update_height(order_id, &transaction.id, transaction.height, t.tx.conn()).await?;
            }
            return Ok(false);
        }
        let order = orders::fetch_order(order_id, t.tx.conn())
            .await?
            .ok_or_else(|| OrderFlowError::NotFound(order_id.clone()))?;
        let received = transaction.received_by(&order.payment_address);
        if received.is_positive() {
            info!(
                "🔄️ Order {order_id} received {received} {} in {}. {} of {} paid",
                order.payment_coin,
                transaction.id,
                order.funding_total(),
                order.payment_amount
            );
            self.emit(t, events::PaymentReceived {
                order_id: order_id.clone(),
                txid: transaction.id.clone(),
                amount: received,
                funding_total: order.funding_total(),
            });
        }
        if transaction.spent_from(&order.payment_address).is_positive() && order.escrow_balance().is_zero() {
            info!("🔄️ The escrow of order {order_id} was spent in full by {}", transaction.id);
            self.emit(t, events::PaymentFinalized { order_id: order_id.clone(), txid: transaction.id.clone() });
        }
        Ok(true)
    }

    /// Records a transaction the wallet already knows about, if the order has not seen it yet.
    pub(crate) async fn record_txid(
        &self,
        t: &mut Transition,
        order: &OrderRecord,
        txid: Option<&str>,
        must_fund: bool,
    ) -> Result<(), OrderFlowError> {
        let Some(txid) = txid else {
            return Ok(());
        };
        if order.has_transaction(txid) {
            return Ok(());
        }
        let wallet = self.wallet_for(&order.payment_coin)?;
        match wallet.get_transaction(txid).await? {
            Some(transaction) => {
                if must_fund && !transaction.received_by(&order.payment_address).is_positive() {
                    return Err(OrderFlowError::bad_request(format!(
                        "transaction {txid} does not pay into the order's payment address"
                    )));
                }
                self.record_transaction(t, &order.order_id, &transaction).await?;
            },
            None => debug!("🔄️ Transaction {txid} for order {} is not in our wallet yet", order.order_id),
        }
        Ok(())
    }

    /// Broadcasts a wallet batch holding `txid` and records the transaction against the order.
    /// Returns false if another spend of the same outputs got there first.
    pub(crate) async fn broadcast(
        &self,
        t: &mut Transition,
        order_id: &OrderId,
        coin: &str,
        batch: WalletBatch,
        txid: &str,
    ) -> Result<bool, OrderFlowError> {
        let wallet = self.wallet_for(coin)?;
        match wallet.commit(batch).await {
            Ok(_) => {},
            Err(WalletError::AlreadySpent) => {
                info!("🔄️ Transaction {txid} for order {order_id} lost the race for its inputs");
                return Ok(false);
            },
            Err(e) => return Err(e.into()),
        }
        match wallet.get_transaction(txid).await? {
            Some(transaction) => {
                self.record_transaction(t, order_id, &transaction).await?;
            },
            None => warn!("🔄️ Broadcast {txid} for order {order_id}, but the wallet does not report it"),
        }
        Ok(true)
    }

    /// Recomputes the order's funding flag and summary state after a transition. The first time an order is seen
    /// to be funded, `OrderFunded` is published, and the vendor of a moderated order sends its rating signatures.
    pub(crate) async fn refresh(&self, t: &mut Transition, order_id: &OrderId) -> Result<(), OrderFlowError> {
        let (order, open) = self.load(t, order_id).await?;
        let funded = is_funded(&order);
        let newly_funded = funded && !order.funding_notified;
        let order = if newly_funded {
            info!("🔄️ Order {order_id} is funded: {} {}", order.funding_total(), order.payment_coin);
            self.emit(t, events::OrderFunded {
                order_id: order_id.clone(),
                role: order.role,
                funding_total: order.funding_total(),
            });
            let owes_signatures = order.role == Role::Vendor &&
                order.payment_method == PaymentMethod::Moderated &&
                order
                    .has_any(&[MessageKind::RatingSignatures, MessageKind::OrderReject, MessageKind::OrderCancel])
                    .is_none();
            if owes_signatures {
                let signatures = sign_rating_keys(&self.identity, &open)?;
                let message = OrderMessage::RatingSignatures(RatingSignatures { timestamp: Utc::now(), signatures });
                self.send_own(t, order_id, &open, message).await?;
                self.load(t, order_id).await?.0
            } else {
                order
            }
        } else {
            order
        };
        let state = derive_state(&order, &open, funded)?;
        if state != order.state {
            debug!("🔄️ Order {order_id} moves from {} to {state}", order.state);
        }
        orders::update_summary(order_id, state, funded, order.funding_notified || newly_funded, t.tx.conn()).await?;
        Ok(())
    }
}
