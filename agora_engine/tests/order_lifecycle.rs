use std::time::Duration;

use agora_common::Amount;
use agora_engine::{
    db_types::{MessageKind, OrderId, OrderRecord, OrderState, PaymentMethod, PeerId, Role},
    order_messages::{FulfilledItem, OrderCancel, OrderMessage, SignedOrderMessage},
    ratings::RatingScores,
    test_utils::{
        fixtures::{chair_item, CHAIR_SLUG},
        network::TestMarket,
    },
    traits::Wallet,
    DisputeSplit,
    ItemReview,
    OrderFlowError,
};
use chrono::Utc;

async fn place_order(market: &TestMarket, method: PaymentMethod) -> OrderId {
    market.buyer.fund_wallet(100_000).await;
    market.settle().await;
    let outcome = market.buyer.api.purchase(market.purchase_request(method, 1)).await.unwrap();
    market.settle().await;
    outcome.order_id
}

async fn pay(market: &TestMarket, order_id: &OrderId) -> String {
    let outcome = market.buyer.api.pay(order_id).await.unwrap();
    market.settle().await;
    outcome.txid.expect("pay always broadcasts")
}

fn review(text: &str) -> ItemReview {
    let scores = RatingScores { overall: 5, quality: 4, description: 5, delivery_speed: 3, customer_service: 5 };
    ItemReview { scores, review: text.into() }
}

fn shipped() -> Vec<FulfilledItem> {
    vec![FulfilledItem { item_index: 0, tracking: None, digital: None, note: "Posted today".into() }]
}

fn own_messages_acked(order: &OrderRecord, me: &PeerId) -> bool {
    order
        .messages
        .iter()
        .filter(|m| SignedOrderMessage::from_blob(&m.blob).unwrap().sender == *me)
        .all(|m| m.acked)
}

fn is_unexpected(err: &OrderFlowError, expected: MessageKind) -> bool {
    matches!(err, OrderFlowError::UnexpectedMessage { kind, .. } if *kind == expected)
}

#[tokio::test]
async fn direct_order_from_purchase_to_review() {
    let market = TestMarket::new().await;
    let id = place_order(&market, PaymentMethod::Direct).await;
    let vendor_order = market.vendor.order(&id).await;
    assert_eq!(vendor_order.role, Role::Vendor);
    assert_eq!(vendor_order.state, OrderState::AwaitingPayment);

    pay(&market, &id).await;
    assert_eq!(market.vendor.order(&id).await.state, OrderState::Funded);
    market.vendor.api.confirm(&id).await.unwrap();
    market.settle().await;
    assert_eq!(market.buyer.order(&id).await.state, OrderState::AwaitingFulfillment);
    market.vendor.api.fulfill(&id, shipped(), "Thanks!").await.unwrap();
    market.settle().await;
    assert_eq!(market.buyer.order(&id).await.state, OrderState::Fulfilled);

    let outcome = market.buyer.api.complete(&id, vec![review("Sturdy, and very red")], false).await.unwrap();
    market.settle().await;
    tokio::time::timeout(Duration::from_secs(1), outcome.delivered()).await.expect("ACK timed out").unwrap();

    let vendor_order = market.vendor.order(&id).await;
    let buyer_order = market.buyer.order(&id).await;
    assert_eq!(vendor_order.state, OrderState::Completed);
    assert_eq!(buyer_order.state, OrderState::Completed);
    assert!(own_messages_acked(&vendor_order, market.vendor.peer_id()));
    assert!(own_messages_acked(&buyer_order, market.buyer.peer_id()));

    let events = market.vendor.event_names().await;
    assert!(events.contains(&"OrderFunded"));
    assert!(events.contains(&"OrderCompletion"));

    let index = market.vendor.api.rating_index().await.unwrap();
    let entry = index.entry(CHAIR_SLUG).expect("chair has no ratings");
    assert_eq!(entry.count, 1);
    let complete = market
        .vendor
        .api
        .order_messages(&id)
        .await
        .unwrap()
        .into_iter()
        .find_map(|m| match m.message {
            OrderMessage::OrderComplete(c) => Some(c),
            _ => None,
        })
        .expect("no ORDER_COMPLETE stored");
    assert_eq!(complete.ratings[0].rating_data.review, "Sturdy, and very red");

    // The vendor swept the escrow on confirmation
    let open = market.vendor.api.order_open(&id).await.unwrap();
    let paid_out = open.payment.amount.clone() - open.payment.escrow_release_fee.clone();
    assert_eq!(market.vendor.wallet.balance().await.unwrap().confirmed, paid_out);
    assert!(vendor_order.escrow_balance().is_zero());
}

#[tokio::test]
async fn cancelled_order_cannot_be_confirmed() {
    let market = TestMarket::new().await;
    let id = place_order(&market, PaymentMethod::Cancelable).await;
    pay(&market, &id).await;

    let outcome = market.buyer.api.cancel(&id).await.unwrap();
    assert!(outcome.txid.is_some());
    market.settle().await;
    assert_eq!(market.buyer.order(&id).await.state, OrderState::Cancelled);
    assert_eq!(market.vendor.order(&id).await.state, OrderState::Cancelled);
    assert!(market.vendor.event_names().await.contains(&"OrderCancel"));

    let err = market.vendor.api.confirm(&id).await.unwrap_err();
    assert!(is_unexpected(&err, MessageKind::OrderConfirmation), "{err}");
    assert!(!market.vendor.order(&id).await.has(MessageKind::OrderConfirmation));

    let open = market.buyer.api.order_open(&id).await.unwrap();
    let refunded = open.payment.amount.clone() - open.payment.escrow_release_fee.clone();
    assert_eq!(market.net.chain.balance_of(&open.refund_address), refunded);
}

#[tokio::test]
async fn direct_orders_cannot_be_cancelled() {
    let market = TestMarket::new().await;
    let id = place_order(&market, PaymentMethod::Direct).await;

    let err = market.buyer.api.cancel(&id).await.unwrap_err();
    assert!(is_unexpected(&err, MessageKind::OrderCancel), "{err}");

    // The same cancel arriving at the vendor is rejected and kept for inspection
    let cancel = OrderMessage::OrderCancel(OrderCancel { timestamp: Utc::now(), refund_txid: None });
    let signed = SignedOrderMessage::sign(&market.identities.buyer, id.clone(), cancel).unwrap();
    let err = market.vendor.api.process_message(signed).await.unwrap_err();
    assert!(is_unexpected(&err, MessageKind::OrderCancel), "{err}");
    let errored = market.vendor.api.errored_messages(&id).await.unwrap();
    assert_eq!(errored.len(), 1);
    assert_eq!(errored[0].kind, MessageKind::OrderCancel);
    assert_eq!(market.vendor.order(&id).await.state, OrderState::AwaitingPayment);
}

#[tokio::test]
async fn rejected_order_still_records_payment() {
    let market = TestMarket::new().await;
    let id = place_order(&market, PaymentMethod::Direct).await;
    market.vendor.api.reject(&id, "Out of oak").await.unwrap();
    market.settle().await;
    assert_eq!(market.buyer.order(&id).await.state, OrderState::Declined);
    assert!(market.buyer.event_names().await.contains(&"OrderDeclined"));

    // The buyer pays anyway
    let txid = pay(&market, &id).await;
    let vendor_order = market.vendor.order(&id).await;
    assert!(vendor_order.has_transaction(&txid));
    assert!(vendor_order.has(MessageKind::PaymentSent));
    assert_eq!(vendor_order.funding_total(), vendor_order.payment_amount);
    assert_eq!(vendor_order.state, OrderState::Declined);

    let err = market.vendor.api.confirm(&id).await.unwrap_err();
    assert!(is_unexpected(&err, MessageKind::OrderConfirmation), "{err}");

    // ...and gets the money back
    let outcome = market.vendor.api.refund(&id).await.unwrap();
    assert!(outcome.txid.is_some());
    market.settle().await;
    let buyer_order = market.buyer.order(&id).await;
    assert!(buyer_order.has(MessageKind::Refund));
    let open = market.buyer.api.order_open(&id).await.unwrap();
    let refunded = open.payment.amount.clone() - open.payment.escrow_release_fee.clone();
    assert_eq!(market.net.chain.balance_of(&open.refund_address), refunded);
}

#[tokio::test]
async fn moderated_order_released_on_completion() {
    let market = TestMarket::new().await;
    let id = place_order(&market, PaymentMethod::Moderated).await;
    pay(&market, &id).await;
    // A funded moderated order gets the vendor's rating signatures straight away
    assert!(market.buyer.order(&id).await.has(MessageKind::RatingSignatures));
    assert!(market.buyer.event_names().await.contains(&"RatingSignaturesReceived"));

    market.vendor.api.confirm(&id).await.unwrap();
    market.settle().await;
    market.vendor.api.fulfill(&id, shipped(), "").await.unwrap();
    market.settle().await;
    market.buyer.api.complete(&id, vec![review("Lovely")], true).await.unwrap();
    market.settle().await;

    let vendor_order = market.vendor.order(&id).await;
    assert_eq!(vendor_order.state, OrderState::Completed);
    assert!(vendor_order.has(MessageKind::PaymentFinalized));
    assert!(vendor_order.escrow_balance().is_zero());
    assert!(market.buyer.order(&id).await.has(MessageKind::PaymentFinalized));
    assert!(market.vendor.event_names().await.contains(&"PaymentFinalized"));

    let open = market.vendor.api.order_open(&id).await.unwrap();
    let paid_out = open.payment.amount.clone() - open.payment.escrow_release_fee.clone();
    assert_eq!(market.vendor.wallet.balance().await.unwrap().confirmed, paid_out);
    let entry = market.vendor.api.rating_index().await.unwrap().entry(CHAIR_SLUG).cloned().unwrap();
    assert_eq!(entry.count, 1);
}

#[tokio::test]
async fn moderated_dispute_splits_the_escrow() {
    let market = TestMarket::new().await;
    let id = place_order(&market, PaymentMethod::Moderated).await;
    pay(&market, &id).await;
    assert!(market.moderator.api.fetch_order(&id).await.is_err(), "moderators only hear of disputed orders");

    market.buyer.api.open_dispute(&id, "The chair never arrived").await.unwrap();
    market.settle().await;
    let moderator_order = market.moderator.order(&id).await;
    assert_eq!(moderator_order.role, Role::Moderator);
    assert_eq!(moderator_order.state, OrderState::Disputed);
    assert!(moderator_order.has(MessageKind::DisputeUpdate), "the vendor answers the dispute");
    assert_eq!(moderator_order.funding_total(), moderator_order.payment_amount);
    assert_eq!(market.vendor.order(&id).await.state, OrderState::Disputed);

    let split = DisputeSplit {
        buyer: Amount::from(20_000u64),
        vendor: Amount::from(3_750u64),
        moderator: Amount::from(1_250u64),
    };
    market.moderator.api.close_dispute(&id, split, "Partial refund").await.unwrap();
    market.settle().await;

    for node in [&market.buyer, &market.vendor, &market.moderator] {
        let order = node.order(&id).await;
        assert_eq!(order.state, OrderState::Resolved, "{} did not resolve the dispute", node.name);
        assert!(order.escrow_balance().is_zero());
    }
    for node in [&market.buyer, &market.vendor] {
        assert!(node.event_names().await.contains(&"PaymentFinalized"), "{} saw no final payment", node.name);
    }

    let txid = market
        .buyer
        .api
        .order_messages(&id)
        .await
        .unwrap()
        .into_iter()
        .find_map(|m| match m.message {
            OrderMessage::PaymentFinalized(p) => Some(p.txid),
            _ => None,
        })
        .expect("no PAYMENT_FINALIZED stored");
    let release = market.net.chain.transaction(&txid).expect("release was not mined");
    let mut amounts = release.outputs.iter().map(|o| o.amount.clone()).collect::<Vec<_>>();
    amounts.sort();
    assert_eq!(amounts, vec![Amount::from(1_250u64), Amount::from(3_750u64), Amount::from(20_000u64)]);
    let spent: Amount = release.inputs.iter().map(|i| &i.amount).sum();
    assert_eq!(spent, Amount::from(25_000u64));

    let open = market.buyer.api.order_open(&id).await.unwrap();
    assert_eq!(market.net.chain.balance_of(&open.refund_address), Amount::from(20_000u64));
}

#[tokio::test]
async fn vendor_claims_escrow_after_timeout() {
    let market = TestMarket::new().await;
    market.buyer.fund_wallet(100_000).await;
    market.settle().await;
    let listing = market.chair(1);
    let mut request = market.purchase_request(PaymentMethod::Moderated, 1);
    request.items = vec![chair_item(&listing)];
    request.listings = vec![listing];
    let id = market.buyer.api.purchase(request).await.unwrap().order_id;
    market.settle().await;
    pay(&market, &id).await;

    assert!(market.vendor.api.release_funds_after_timeout(&id).await.is_err(), "the escrow is still time locked");
    assert!(!market.vendor.order(&id).await.has(MessageKind::PaymentFinalized));

    market.net.chain.mine_blocks(6).unwrap();
    let outcome = market.vendor.api.release_funds_after_timeout(&id).await.unwrap();
    assert!(outcome.txid.is_some());
    market.settle().await;

    assert_eq!(market.vendor.order(&id).await.state, OrderState::PaymentFinalized);
    assert_eq!(market.buyer.order(&id).await.state, OrderState::PaymentFinalized);
    let open = market.vendor.api.order_open(&id).await.unwrap();
    let paid_out = open.payment.amount.clone() - open.payment.escrow_release_fee.clone();
    assert_eq!(market.vendor.wallet.balance().await.unwrap().confirmed, paid_out);
}
