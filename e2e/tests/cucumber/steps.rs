use agora_common::Amount;
use agora_engine::{
    db_types::{MessageKind, OrderState, PaymentMethod, Role},
    order_messages::{FulfilledItem, OrderMessage},
    ratings::RATING_INDEX_PATH,
    test_utils::network::TestNode,
    ActionOutcome,
    DisputeSplit,
    OrderFlowError,
    ProcessOutcome,
};
use cucumber::{gherkin::Step, given, then, when};
use e2e::helpers::json_mismatch;
use log::*;

use crate::cucumber::{
    setup::{place_order, review, start_market, stored_message},
    AgoraWorld,
};

fn record(world: &mut AgoraWorld, result: Result<ActionOutcome, OrderFlowError>) {
    match result {
        Ok(outcome) => {
            world.last_txid = outcome.txid;
            world.last_error = None;
        },
        Err(e) => {
            debug!("🚀️ Action failed: {e}");
            world.last_error = Some(e);
        },
    }
}

//----------------------------------------------   Given  ----------------------------------------------------
#[given("a marketplace with a buyer, a vendor and a moderator")]
async fn marketplace(world: &mut AgoraWorld) {
    start_market(world).await;
}

#[given(expr = "the buyer's wallet holds {int} satoshis")]
async fn fund_buyer(world: &mut AgoraWorld, amount: u64) {
    world.market().buyer.fund_wallet(amount).await;
    world.settle().await;
}

#[given(expr = "the buyer has opened a {word} order for {int} chair(s)")]
async fn opened_order(world: &mut AgoraWorld, method: String, n: usize) {
    open_order(world, method, n).await;
}

#[when(expr = "the buyer opens a {word} order for {int} chair(s)")]
async fn open_order(world: &mut AgoraWorld, method: String, n: usize) {
    let method = method.parse::<PaymentMethod>().expect("Unknown payment method");
    place_order(world, method, n).await;
}

//----------------------------------------------   Actions  ----------------------------------------------------
#[given("the buyer has paid for the order")]
async fn buyer_paid(world: &mut AgoraWorld) {
    buyer_pays(world).await;
    assert!(world.last_error.is_none(), "Payment failed: {:?}", world.last_error);
}

#[when("the buyer pays for the order")]
async fn buyer_pays(world: &mut AgoraWorld) {
    let id = world.order_id();
    let result = world.market().buyer.api.pay(&id).await;
    record(world, result);
    world.settle().await;
}

#[when("the buyer cancels the order")]
async fn buyer_cancels(world: &mut AgoraWorld) {
    let id = world.order_id();
    let result = world.market().buyer.api.cancel(&id).await;
    record(world, result);
    world.settle().await;
}

#[given("the vendor has confirmed the order")]
async fn vendor_confirmed(world: &mut AgoraWorld) {
    vendor_confirms(world).await;
    assert!(world.last_error.is_none(), "Confirmation failed: {:?}", world.last_error);
}

#[when("the vendor confirms the order")]
async fn vendor_confirms(world: &mut AgoraWorld) {
    let id = world.order_id();
    let result = world.market().vendor.api.confirm(&id).await;
    record(world, result);
    world.settle().await;
}

#[when(expr = "the vendor rejects the order because {string}")]
async fn vendor_rejects(world: &mut AgoraWorld, reason: String) {
    let id = world.order_id();
    let result = world.market().vendor.api.reject(&id, &reason).await;
    record(world, result);
    world.settle().await;
}

#[given(expr = "the vendor has shipped the order with the note {string}")]
async fn vendor_shipped(world: &mut AgoraWorld, note: String) {
    vendor_ships(world, note).await;
}

#[when(expr = "the vendor ships the order with the note {string}")]
async fn vendor_ships(world: &mut AgoraWorld, note: String) {
    let id = world.order_id();
    let items = vec![FulfilledItem { item_index: 0, tracking: None, digital: None, note: "Posted today".into() }];
    let result = world.market().vendor.api.fulfill(&id, items, &note).await;
    record(world, result);
    world.settle().await;
}

#[when(expr = "the buyer completes the order with the review {string}")]
async fn buyer_completes(world: &mut AgoraWorld, text: String) {
    let id = world.order_id();
    let result = world.market().buyer.api.complete(&id, vec![review(&text)], false).await;
    record(world, result);
    world.settle().await;
}

#[when("the vendor refunds the buyer")]
async fn vendor_refunds(world: &mut AgoraWorld) {
    let id = world.order_id();
    let result = world.market().vendor.api.refund(&id).await;
    record(world, result);
    world.settle().await;
}

#[when(expr = "the buyer opens a dispute claiming {string}")]
async fn buyer_disputes(world: &mut AgoraWorld, claim: String) {
    let id = world.order_id();
    let result = world.market().buyer.api.open_dispute(&id, &claim).await;
    record(world, result);
    world.settle().await;
}

#[when(expr = "the moderator awards {int} to the buyer, {int} to the vendor and keeps {int}")]
async fn moderator_decides(world: &mut AgoraWorld, buyer: u64, vendor: u64, moderator: u64) {
    let id = world.order_id();
    let split =
        DisputeSplit { buyer: Amount::from(buyer), vendor: Amount::from(vendor), moderator: Amount::from(moderator) };
    let result = world.market().moderator.api.close_dispute(&id, split, "Partial refund").await;
    record(world, result);
    world.settle().await;
}

//----------------------------------------------   Replay  ----------------------------------------------------
#[when("the buyer restores their identity on a second device")]
async fn restore_buyer(world: &mut AgoraWorld) {
    let market = world.market();
    let node = TestNode::offline(&market.net, "restored buyer", market.identities.buyer.clone()).await;
    world.restored = Some(node);
}

#[when(expr = "the second device receives the buyer's copy of {word}")]
async fn replay_message(world: &mut AgoraWorld, kind: String) {
    let kind = kind.parse::<MessageKind>().expect("Unknown message kind");
    let message = stored_message(world, "buyer", kind).await;
    let restored = world.restored.as_ref().expect("The buyer has not been restored");
    match restored.api.process_message(message).await {
        Ok(outcome) => world.last_outcome = Some(outcome),
        Err(e) => panic!("The second device refused {kind}. {e}"),
    }
}

#[then(expr = "the message is {word}")]
async fn replay_outcome(world: &mut AgoraWorld, expected: String) {
    let outcome = world.last_outcome.take().expect("No message was processed");
    let matches = match (expected.as_str(), outcome) {
        ("parked", ProcessOutcome::Parked(_)) => true,
        ("applied", ProcessOutcome::Applied(_)) => true,
        ("ignored", ProcessOutcome::Duplicate) => true,
        _ => false,
    };
    assert!(matches, "Expected the message to be {expected}, but it was {outcome:?}");
}

#[then("the second device does not know the order yet")]
async fn restored_has_no_order(world: &mut AgoraWorld) {
    let id = world.order_id();
    let restored = world.node("restored buyer");
    assert!(restored.api.fetch_order(&id).await.is_err());
    assert!(!restored.api.parked_messages(&id).await.unwrap().is_empty());
}

#[then("the second device agrees with the buyer about the order")]
async fn restored_agrees(world: &mut AgoraWorld) {
    let original = world.order_for("buyer").await;
    let replayed = world.order_for("restored buyer").await;
    assert_eq!(replayed.state, original.state);
    assert_eq!(replayed.funding_total(), original.funding_total());
    let mut a = original.messages.into_iter().map(|m| m.blob).collect::<Vec<_>>();
    let mut b = replayed.messages.into_iter().map(|m| m.blob).collect::<Vec<_>>();
    a.sort();
    b.sort();
    assert_eq!(a, b, "The second device holds different messages");
}

//----------------------------------------------   Then  ----------------------------------------------------
#[then(expr = "the {word} sees the order as {word}")]
async fn order_state(world: &mut AgoraWorld, who: String, state: String) {
    let expected = state.parse::<OrderState>().expect("Unknown order state");
    let order = world.order_for(&who).await;
    assert_eq!(order.state, expected, "The {who} sees the order as {}", order.state);
}

#[then(expr = "the {word} takes part in the order as {word}")]
async fn order_role(world: &mut AgoraWorld, who: String, role: String) {
    let expected = role.parse::<Role>().expect("Unknown role");
    assert_eq!(world.order_for(&who).await.role, expected);
}

#[then(expr = "the {word} has a {word} message")]
async fn has_message(world: &mut AgoraWorld, who: String, kind: String) {
    let kind = kind.parse::<MessageKind>().expect("Unknown message kind");
    assert!(world.order_for(&who).await.has(kind), "The {who} has no {kind} message");
}

#[then(expr = "the {word} has no {word} message")]
async fn lacks_message(world: &mut AgoraWorld, who: String, kind: String) {
    let kind = kind.parse::<MessageKind>().expect("Unknown message kind");
    assert!(!world.order_for(&who).await.has(kind), "The {who} has a {kind} message");
}

#[then(expr = "the {word} saw a {word} event")]
async fn saw_event(world: &mut AgoraWorld, who: String, event: String) {
    let names = world.node(&who).event_names().await;
    assert!(names.contains(&event.as_str()), "The {who} saw {names:?}");
}

#[then(expr = "the action fails because {word} is unexpected")]
async fn unexpected_message(world: &mut AgoraWorld, kind: String) {
    let expected = kind.parse::<MessageKind>().expect("Unknown message kind");
    let err = world.take_error();
    assert!(
        matches!(&err, OrderFlowError::UnexpectedMessage { kind, .. } if *kind == expected),
        "Expected {expected} to be unexpected, got: {err}"
    );
}

#[then("the action succeeds with a transaction")]
async fn action_broadcast(world: &mut AgoraWorld) {
    assert!(world.last_error.is_none(), "The action failed: {:?}", world.last_error);
    assert!(world.last_txid.is_some(), "The action did not broadcast a transaction");
}

#[then("the vendor records the buyer's payment")]
async fn vendor_records_payment(world: &mut AgoraWorld) {
    let txid = world.last_txid.clone().expect("The buyer has not paid");
    let order = world.order_for("vendor").await;
    assert!(order.has_transaction(&txid), "The vendor has no record of {txid}");
    assert_eq!(order.funding_total(), order.payment_amount);
}

#[then(expr = "the {word}'s escrow is empty")]
async fn escrow_empty(world: &mut AgoraWorld, who: String) {
    let order = world.order_for(&who).await;
    assert!(order.escrow_balance().is_zero(), "The {who} sees {} left in escrow", order.escrow_balance());
}

#[then("the buyer's refund address holds the payment less the release fee")]
async fn refund_less_fee(world: &mut AgoraWorld) {
    let id = world.order_id();
    let market = world.market();
    let open = market.buyer.api.order_open(&id).await.expect("No ORDER_OPEN");
    let refunded = open.payment.amount.clone() - open.payment.escrow_release_fee.clone();
    assert_eq!(market.net.chain.balance_of(&open.refund_address), refunded);
}

#[then(expr = "the buyer's refund address holds {int}")]
async fn refund_address_holds(world: &mut AgoraWorld, amount: u64) {
    let id = world.order_id();
    let market = world.market();
    let open = market.buyer.api.order_open(&id).await.expect("No ORDER_OPEN");
    assert_eq!(market.net.chain.balance_of(&open.refund_address), Amount::from(amount));
}

#[then(expr = "the release transaction pays out {int}, {int} and {int}")]
async fn release_outputs(world: &mut AgoraWorld, a: u64, b: u64, c: u64) {
    let message = stored_message(world, "buyer", MessageKind::PaymentFinalized).await;
    let OrderMessage::PaymentFinalized(finalized) = message.message else {
        panic!("Not a PAYMENT_FINALIZED message");
    };
    let release = world.market().net.chain.transaction(&finalized.txid).expect("The release was not mined");
    let mut amounts = release.outputs.iter().map(|o| o.amount.clone()).collect::<Vec<_>>();
    amounts.sort();
    assert_eq!(amounts, vec![Amount::from(a), Amount::from(b), Amount::from(c)]);
}

#[then(expr = "the review of the order reads {string}")]
async fn review_reads(world: &mut AgoraWorld, text: String) {
    let message = stored_message(world, "vendor", MessageKind::OrderComplete).await;
    let OrderMessage::OrderComplete(complete) = message.message else {
        panic!("Not an ORDER_COMPLETE message");
    };
    assert_eq!(complete.ratings[0].rating_data.review, text);
}

#[then("the vendor publishes the rating index:")]
async fn rating_index(world: &mut AgoraWorld, step: &Step) {
    let expected = step.docstring().expect("No expected rating index");
    let contents = world
        .market()
        .vendor
        .api
        .db()
        .public_data()
        .read(RATING_INDEX_PATH)
        .await
        .expect("Could not read public data")
        .expect("The vendor has not published a rating index");
    let actual = String::from_utf8(contents).expect("The rating index is not UTF-8");
    if let Some(mismatch) = json_mismatch(expected, &actual) {
        panic!("Unexpected rating index: {mismatch}\n{actual}");
    }
}
