use std::fmt::{Debug, Formatter};

use agora_engine::{
    db_types::{OrderId, OrderRecord},
    test_utils::network::{TestMarket, TestNode},
    OrderFlowError,
    ProcessOutcome,
};
use cucumber::World;

#[derive(World, Default)]
pub struct AgoraWorld {
    pub market: Option<TestMarket>,
    pub order_id: Option<OrderId>,
    /// The txid of the last action that broadcast a transaction
    pub last_txid: Option<String>,
    pub last_error: Option<OrderFlowError>,
    pub last_outcome: Option<ProcessOutcome>,
    /// The buyer's identity, restored on a device that no other node can reach
    pub restored: Option<TestNode>,
}

impl Debug for AgoraWorld {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgoraWorld")
            .field("market", &self.market.is_some())
            .field("order_id", &self.order_id)
            .field("last_txid", &self.last_txid)
            .field("last_error", &self.last_error.as_ref().map(|e| e.to_string()))
            .field("last_outcome", &self.last_outcome)
            .field("restored", &self.restored.as_ref().map(|n| n.name.as_str()))
            .finish()
    }
}

impl AgoraWorld {
    pub fn market(&self) -> &TestMarket {
        self.market.as_ref().expect("The marketplace has not been set up")
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id.clone().expect("No order has been placed")
    }

    /// Looks up a node by the name used in the feature files.
    pub fn node(&self, who: &str) -> &TestNode {
        let market = self.market();
        match who {
            "buyer" => &market.buyer,
            "vendor" => &market.vendor,
            "moderator" => &market.moderator,
            "restored buyer" => self.restored.as_ref().expect("The buyer has not been restored"),
            _ => panic!("Unknown participant {who}"),
        }
    }

    pub async fn order_for(&self, who: &str) -> OrderRecord {
        self.node(who).order(&self.order_id()).await
    }

    /// Settles the network, leaving out the restored node, which nobody can reach.
    pub async fn settle(&self) {
        self.market().settle().await;
    }

    pub fn take_error(&mut self) -> OrderFlowError {
        self.last_error.take().expect("The last action did not fail")
    }
}
