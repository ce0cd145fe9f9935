use agora_engine::{
    db_types::{MessageKind, OrderId, PaymentMethod},
    order_messages::SignedOrderMessage,
    ratings::RatingScores,
    test_utils::network::TestMarket,
    ItemReview,
};
use log::*;

use crate::cucumber::AgoraWorld;

/// Starts a fresh buyer, vendor and moderator on their own network and chain.
pub async fn start_market(world: &mut AgoraWorld) {
    let market = TestMarket::new().await;
    debug!(
        "🚀️ Market started. Buyer {}, vendor {}, moderator {}",
        market.buyer.peer_id().short(),
        market.vendor.peer_id().short(),
        market.moderator.peer_id().short()
    );
    world.market = Some(market);
}

/// Has the buyer open an order for `n` chairs, and waits for the vendor to receive it.
pub async fn place_order(world: &mut AgoraWorld, method: PaymentMethod, n: usize) -> OrderId {
    let market = world.market();
    let request = market.purchase_request(method, n);
    let outcome = market.buyer.api.purchase(request).await.expect("Purchase failed");
    world.settle().await;
    info!("🚀️ {method} order {} placed", outcome.order_id);
    world.order_id = Some(outcome.order_id.clone());
    outcome.order_id
}

pub fn review(text: &str) -> ItemReview {
    let scores = RatingScores { overall: 5, quality: 4, description: 5, delivery_speed: 3, customer_service: 5 };
    ItemReview { scores, review: text.into() }
}

/// The first stored message of `kind` that `who` holds for the current order.
pub async fn stored_message(world: &AgoraWorld, who: &str, kind: MessageKind) -> SignedOrderMessage {
    let id = world.order_id();
    world
        .node(who)
        .api
        .order_messages(&id)
        .await
        .expect("Could not read order messages")
        .into_iter()
        .find(|m| m.kind() == kind)
        .unwrap_or_else(|| panic!("The {who} has no {kind} message for {id}"))
}
