//! Whole nodes on one in-memory network and one simulated chain, pumped by hand.
//!
//! Nothing runs in the background apart from the simulated wallets' chain listeners. [`TestNetwork::settle`] moves
//! envelopes, ACKs and wallet transactions around until every node has gone quiet, which keeps multi-node tests
//! deterministic.
use std::{sync::Arc, time::Duration};

use log::*;
use num_bigint::BigInt;
use num_rational::BigRational;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::{
    db_types::{OrderId, OrderRecord, PaymentMethod, PeerId, WalletTransaction},
    events::{DomainEvent, EventBus},
    exchange_rates::{ExchangeRateCache, StaticRateSource, DEFAULT_RATE_TTL},
    helpers::NodeIdentity,
    messenger::{InMemoryNetwork, MessengerConfig, PeerEnvelope, ReliableMessenger},
    order_flow::{ModeratorInfo, OrderFlowApi, PurchaseRequest},
    order_messages::SignedListing,
    test_utils::{
        fixtures::{chair_item, shipping_address, Marketplace, TEST_COIN},
        prepare_env::test_db,
    },
    traits::Wallet,
    wallet::{MultiWallet, SimulatedChain, SimulatedWallet},
};

/// USD per BTC in every test network.
pub const TEST_BTC_PRICE_USD: u64 = 50_000;

const QUIET_ROUNDS: usize = 3;
const MAX_ROUNDS: usize = 500;

#[derive(Clone)]
pub struct TestNetwork {
    pub network: InMemoryNetwork,
    pub chain: SimulatedChain,
    pub rates: ExchangeRateCache,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        let usd = BigRational::from_integer(BigInt::from(TEST_BTC_PRICE_USD));
        let source = StaticRateSource::new([("USD", usd)]);
        Self {
            network: InMemoryNetwork::new(),
            chain: SimulatedChain::new(TEST_COIN),
            rates: ExchangeRateCache::new(vec![Arc::new(source)], DEFAULT_RATE_TTL),
        }
    }

    pub async fn join(&self, name: &str, identity: NodeIdentity) -> TestNode {
        TestNode::new(self, name, identity).await
    }

    /// Pumps every node until nothing has moved for a few rounds in a row.
    pub async fn settle(&self, nodes: &[&TestNode]) {
        let mut quiet = 0;
        for _ in 0..MAX_ROUNDS {
            // The wallets forward chain events from their own tasks
            tokio::time::sleep(Duration::from_millis(5)).await;
            let mut work = 0;
            for node in nodes {
                work += node.pump().await;
            }
            quiet = if work == 0 { quiet + 1 } else { 0 };
            if quiet >= QUIET_ROUNDS {
                return;
            }
        }
        warn!("🚀️ The test network did not settle after {MAX_ROUNDS} rounds");
    }
}

pub struct TestNode {
    pub name: String,
    pub api: OrderFlowApi,
    pub wallet: SimulatedWallet,
    inbound: Mutex<mpsc::UnboundedReceiver<PeerEnvelope>>,
    transactions: Mutex<broadcast::Receiver<WalletTransaction>>,
    events: Mutex<broadcast::Receiver<DomainEvent>>,
    seen: Mutex<Vec<DomainEvent>>,
}

impl TestNode {
    pub async fn new(net: &TestNetwork, name: &str, identity: NodeIdentity) -> Self {
        Self::on_network(net, &net.network, name, identity).await
    }

    /// A node on the test chain that no other node can reach, such as a second device restoring an identity.
    pub async fn offline(net: &TestNetwork, name: &str, identity: NodeIdentity) -> Self {
        Self::on_network(net, &InMemoryNetwork::new(), name, identity).await
    }

    async fn on_network(net: &TestNetwork, network: &InMemoryNetwork, name: &str, identity: NodeIdentity) -> Self {
        let db = test_db().await;
        let wallet = SimulatedWallet::random(net.chain.clone());
        wallet.open().await.expect("Could not open wallet");
        let transactions = wallet.subscribe_transactions();
        let wallets = MultiWallet::new().with_wallet(Arc::new(wallet.clone()));
        let inbound = network.connect(identity.peer_id(), vec![]).expect("Could not join the network");
        let config = MessengerConfig {
            retry_base: Duration::from_millis(50),
            retry_cap: Duration::from_millis(500),
            ..MessengerConfig::default()
        };
        let messenger =
            ReliableMessenger::new(identity.peer_id().clone(), db.clone(), Arc::new(network.clone()), config);
        let bus = EventBus::default();
        let events = bus.subscribe_all();
        let api = OrderFlowApi::new(db, identity, wallets, messenger, bus, net.rates.clone());
        debug!("🚀️ {name} is {}", api.peer_id().short());
        Self {
            name: name.to_string(),
            api,
            wallet,
            inbound: Mutex::new(inbound),
            transactions: Mutex::new(transactions),
            events: Mutex::new(events),
            seen: Mutex::new(vec![]),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.api.peer_id()
    }

    pub async fn order(&self, order_id: &OrderId) -> OrderRecord {
        self.api.fetch_order(order_id).await.expect("Order not found")
    }

    /// Gives the node's wallet `amount` of test coin.
    pub async fn fund_wallet(&self, amount: u64) {
        let address = self.wallet.new_address(None).await.expect("Could not create address");
        self.wallet.chain().fund(&address, amount.into()).expect("Faucet failed");
    }

    /// Every event this node has published so far, oldest first.
    pub async fn events(&self) -> Vec<DomainEvent> {
        let mut seen = self.seen.lock().await;
        let mut rx = self.events.lock().await;
        loop {
            match rx.try_recv() {
                Ok(event) => seen.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => warn!("🚀️ {} missed {n} events", self.name),
                Err(_) => break,
            }
        }
        seen.clone()
    }

    pub async fn event_names(&self) -> Vec<&'static str> {
        self.events().await.iter().map(|e| e.name()).collect()
    }

    /// One round of work: send what is due, handle what arrived, apply what the wallet saw. Returns how much it did.
    pub async fn pump(&self) -> usize {
        let mut work = 0;
        if let Err(e) = self.api.messenger().process_due().await {
            warn!("🚀️ {} could not send. {e}", self.name);
        }
        loop {
            let envelope = self.inbound.lock().await.try_recv();
            let Ok(envelope) = envelope else {
                break;
            };
            work += 1;
            match self.api.handle_envelope(&envelope).await {
                Ok(outcome) => trace!("🚀️ {} handled {}: {outcome:?}", self.name, envelope.message_id),
                Err(e) => debug!("🚀️ {} refused {}. {e}", self.name, envelope.message_id),
            }
        }
        loop {
            let transaction = self.transactions.lock().await.try_recv();
            let transaction = match transaction {
                Ok(t) => t,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("🚀️ {} missed {n} wallet transactions", self.name);
                    continue;
                },
                Err(_) => break,
            };
            work += 1;
            if let Err(e) = self.api.process_transaction(TEST_COIN, transaction).await {
                warn!("🚀️ {} could not apply a wallet transaction. {e}", self.name);
            }
        }
        work
    }
}

/// A buyer, a vendor and a moderator on one test network.
pub struct TestMarket {
    pub net: TestNetwork,
    pub buyer: TestNode,
    pub vendor: TestNode,
    pub moderator: TestNode,
    pub identities: Marketplace,
}

impl TestMarket {
    pub async fn new() -> Self {
        let net = TestNetwork::new();
        let identities = Marketplace::new();
        let buyer = net.join("buyer", identities.buyer.clone()).await;
        let vendor = net.join("vendor", identities.vendor.clone()).await;
        let moderator = net.join("moderator", identities.moderator.clone()).await;
        Self { net, buyer, vendor, moderator, identities }
    }

    pub async fn settle(&self) {
        self.net.settle(&[&self.buyer, &self.vendor, &self.moderator]).await;
    }

    pub fn chair(&self, escrow_timeout_hours: u32) -> SignedListing {
        self.identities.chair(escrow_timeout_hours)
    }

    /// A purchase of `n_items` red chairs, with the market's moderator if `method` needs one.
    pub fn purchase_request(&self, method: PaymentMethod, n_items: usize) -> PurchaseRequest {
        let listing = self.chair(0);
        let moderator = (method == PaymentMethod::Moderated).then(|| ModeratorInfo {
            peer_id: self.identities.moderator.peer_id().clone(),
            escrow_key: self.identities.moderator.escrow_public().to_string(),
        });
        PurchaseRequest {
            items: (0..n_items).map(|_| chair_item(&listing)).collect(),
            listings: vec![listing],
            shipping: Some(shipping_address()),
            method,
            moderator,
            coin: TEST_COIN.into(),
            refund_address: None,
            alternate_contact_info: String::new(),
        }
    }
}
