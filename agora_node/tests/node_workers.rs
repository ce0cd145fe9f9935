use std::{future::Future, path::PathBuf, time::Duration};

use agora_common::Amount;
use agora_engine::{
    db_types::{OrderState, PaymentMethod},
    helpers::NodeIdentity,
    messenger::{InMemoryNetwork, MessengerConfig},
    test_utils::{
        fixtures::{chair_item, chair_listing, shipping_address, TEST_COIN},
        prepare_env::random_db_path,
    },
    traits::Wallet,
    wallet::SimulatedChain,
    PurchaseRequest,
};
use agora_node::{
    config::{KeyConfig, NodeConfig, RateSourceConfig},
    node::AgoraNode,
};
use num_bigint::BigInt;
use num_rational::BigRational;
use tokio_util::sync::CancellationToken;

fn node_config(identity: &NodeIdentity) -> NodeConfig {
    let _ = env_logger::try_init();
    let [identity_key, escrow_key, rating_key] = identity.to_hex_keys();
    let database_url = random_db_path();
    let public_data_dir = PathBuf::from(format!("{}.public", database_url.trim_start_matches("sqlite://")));
    NodeConfig {
        database_url,
        public_data_dir,
        keys: KeyConfig { identity_key, escrow_key, rating_key },
        exchange_rate_sources: vec![RateSourceConfig::Static(vec![(
            "USD".into(),
            BigRational::from_integer(BigInt::from(50_000)),
        )])],
        messenger: MessengerConfig {
            retry_base: Duration::from_millis(50),
            retry_cap: Duration::from_millis(500),
            ..MessengerConfig::default()
        },
        direct_connect_timeout: Duration::from_secs(1),
        publish_interval: Duration::from_millis(50),
        ..NodeConfig::default()
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("Timed out waiting for {what}");
}

#[tokio::test]
async fn workers_carry_an_order_from_purchase_to_funding() {
    let network = InMemoryNetwork::new();
    let chains = vec![SimulatedChain::new(TEST_COIN)];
    let buyer_id = NodeIdentity::random();
    let vendor_id = NodeIdentity::random();
    let mut buyer = AgoraNode::with_network(node_config(&buyer_id), &network, &chains).await.unwrap();
    let mut vendor = AgoraNode::with_network(node_config(&vendor_id), &network, &chains).await.unwrap();
    assert_eq!(buyer.peer_id(), buyer_id.peer_id());

    let shutdown = CancellationToken::new();
    let mut tasks = buyer.start_workers(shutdown.clone()).unwrap();
    tasks.extend(vendor.start_workers(shutdown.clone()).unwrap());
    assert!(buyer.start_workers(shutdown.clone()).is_err());

    let wallet = buyer.api().wallets().wallet_for(TEST_COIN).unwrap();
    let address = wallet.new_address(None).await.unwrap();
    chains[0].fund(&address, Amount::from(100_000u64)).unwrap();
    let wallet = &wallet;
    eventually("the faucet payment", || async move {
        let balance = wallet.balance().await.unwrap();
        !(balance.confirmed.is_zero() && balance.unconfirmed.is_zero())
    })
    .await;

    let listing = chair_listing(&vendor_id);
    let request = PurchaseRequest {
        items: vec![chair_item(&listing)],
        listings: vec![listing],
        shipping: Some(shipping_address()),
        method: PaymentMethod::Direct,
        moderator: None,
        coin: TEST_COIN.into(),
        refund_address: None,
        alternate_contact_info: String::new(),
    };
    let id = buyer.api().purchase(request).await.unwrap().order_id;
    let (vendor_ref, id_ref) = (&vendor, &id);
    eventually("the vendor to see the order", || async move {
        vendor_ref.api().fetch_order(id_ref).await.is_ok()
    })
    .await;

    buyer.api().pay(&id).await.unwrap();
    eventually("the vendor to see the payment", || async move {
        vendor_ref.api().fetch_order(id_ref).await.map(|o| o.state == OrderState::Funded).unwrap_or(false)
    })
    .await;
    eventually("a public data root", || async move { vendor_ref.published_root().is_some() }).await;

    shutdown.cancel();
    for task in tasks {
        task.await.unwrap();
    }
    buyer.close().await;
    vendor.close().await;
}
