//! Assembles an [`OrderFlowApi`] and its collaborators from a [`NodeConfig`], and runs the node's workers.
use std::{path::Path, sync::Arc};

use agora_engine::{
    db_types::PeerId,
    exchange_rates::{ExchangeRateCache, HttpRateSource, StaticRateSource},
    helpers::{hashing::blake2b_256, ChainCode, NodeIdentity},
    messenger::{InMemoryNetwork, PeerEnvelope, ReliableMessenger},
    traits::RateSource,
    wallet::{MultiWallet, SimulatedChain, SimulatedWallet},
    EventBus,
    OrderFlowApi,
    SqliteDatabase,
};
use log::*;
use secp256k1::SecretKey;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{NodeConfig, RateSourceConfig, WalletConfig},
    errors::NodeError,
    transport::TimeoutTransport,
    workers::{
        start_event_handlers,
        start_inbound_worker,
        start_messenger_worker,
        start_publisher,
        start_wallet_worker,
    },
};

const MAX_DB_CONNECTIONS: u32 = 5;

pub struct AgoraNode {
    config: NodeConfig,
    api: OrderFlowApi,
    inbound: Option<mpsc::UnboundedReceiver<PeerEnvelope>>,
    published: watch::Receiver<Option<String>>,
    publisher: Option<watch::Sender<Option<String>>>,
}

impl AgoraNode {
    /// A node with a fresh in-process network and one simulated chain per configured coin.
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let chains = config.wallet.coins.iter().map(|coin| SimulatedChain::new(coin)).collect::<Vec<_>>();
        Self::with_network(config, &InMemoryNetwork::new(), &chains).await
    }

    /// A node that joins an existing network and opens a wallet on each of `chains`.
    pub async fn with_network(
        config: NodeConfig,
        network: &InMemoryNetwork,
        chains: &[SimulatedChain],
    ) -> Result<Self, NodeError> {
        let identity = config.keys.identity()?;
        info!("🚀️ Node identity is {}", identity.peer_id());
        let db = open_store(&config).await?;
        let wallets = open_wallets(&identity, &config.wallet, chains).await?;
        let rates = ExchangeRateCache::new(rate_sources(&config.exchange_rate_sources)?, config.exchange_rate_ttl);

        let inbound = network.connect(identity.peer_id(), vec![])?;
        let transport = TimeoutTransport::new(Arc::new(network.clone()), config.direct_connect_timeout);
        let messenger = ReliableMessenger::new(
            identity.peer_id().clone(),
            db.clone(),
            Arc::new(transport),
            config.messenger.clone(),
        );
        let api = OrderFlowApi::new(db, identity, wallets, messenger, EventBus::default(), rates)
            .with_config(config.order_flow_config());
        let (publisher, published) = watch::channel(None);
        Ok(Self { config, api, inbound: Some(inbound), published, publisher: Some(publisher) })
    }

    pub fn api(&self) -> &OrderFlowApi {
        &self.api
    }

    pub fn peer_id(&self) -> &PeerId {
        self.api.peer_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The most recently published root hash of the node's public data.
    pub fn published_root(&self) -> Option<String> {
        self.published.borrow().clone()
    }

    /// Spawns every background worker. They stop when `shutdown` is cancelled. Workers can only be started once.
    pub fn start_workers(&mut self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>, NodeError> {
        let (Some(inbound), Some(publisher)) = (self.inbound.take(), self.publisher.take()) else {
            return Err(NodeError::InitializeError("the node's workers are already running".into()));
        };
        let mut tasks = start_event_handlers(self.api.events(), shutdown.clone());
        tasks.push(start_inbound_worker(self.api.clone(), inbound, shutdown.clone()));
        for wallet in self.api.wallets().wallets() {
            tasks.push(start_wallet_worker(self.api.clone(), Arc::clone(wallet), shutdown.clone()));
        }
        tasks.push(start_messenger_worker(&self.api, shutdown.clone()));
        let public = self.api.db().public_data().clone();
        tasks.push(start_publisher(public, self.config.publish_interval, publisher, shutdown));
        info!("🚀️ {} workers started for {}", tasks.len(), self.peer_id().short());
        Ok(tasks)
    }

    pub async fn close(&self) {
        self.api.wallets().close_all().await;
        self.api.db().close().await;
    }
}

async fn open_store(config: &NodeConfig) -> Result<SqliteDatabase, NodeError> {
    if let Some(parent) = sqlite_file(&config.database_url).and_then(Path::parent) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let db =
        SqliteDatabase::new_with_url(&config.database_url, MAX_DB_CONNECTIONS, config.public_data_dir.clone()).await?;
    if config.skip_migrations {
        info!("🗃️ Skipping database migrations");
    } else {
        db.run_migrations().await?;
    }
    Ok(db)
}

/// The file behind a `sqlite://` URL, or `None` for in-memory databases.
fn sqlite_file(url: &str) -> Option<&Path> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    (!path.is_empty() && path != ":memory:").then(|| Path::new(path))
}

async fn open_wallets(
    identity: &NodeIdentity,
    config: &WalletConfig,
    chains: &[SimulatedChain],
) -> Result<MultiWallet, NodeError> {
    let mut wallets = MultiWallet::new();
    for chain in chains {
        let (master, chaincode) = wallet_seed(identity, config, chain.coin())?;
        let wallet = SimulatedWallet::new(chain.clone(), master, chaincode, config.birthday);
        wallets.add(Arc::new(wallet));
    }
    wallets.open_all().await?;
    info!("👛️ Opened wallets for {}", wallets.coins().join(", "));
    Ok(wallets)
}

/// Wallet keys follow from the escrow key, the coin and the wallet password, so restoring an identity restores its
/// wallets.
fn wallet_seed(
    identity: &NodeIdentity,
    config: &WalletConfig,
    coin: &str,
) -> Result<(SecretKey, ChainCode), NodeError> {
    let mut preimage = b"agora-wallet".to_vec();
    preimage.extend_from_slice(&identity.escrow_secret().secret_bytes());
    preimage.extend_from_slice(coin.as_bytes());
    preimage.extend_from_slice(config.password.reveal().as_bytes());
    let seed = blake2b_256(&preimage);
    let master = SecretKey::from_slice(&seed)
        .map_err(|e| NodeError::InitializeError(format!("Could not derive the {coin} wallet key. {e}")))?;
    let chaincode = ChainCode::new(blake2b_256(&seed));
    Ok((master, chaincode))
}

fn rate_sources(configs: &[RateSourceConfig]) -> Result<Vec<Arc<dyn RateSource>>, NodeError> {
    configs
        .iter()
        .map(|source| {
            let source: Arc<dyn RateSource> = match source {
                RateSourceConfig::Http(url) => Arc::new(HttpRateSource::new(url)?),
                RateSourceConfig::Static(rates) => {
                    Arc::new(StaticRateSource::new(rates.iter().map(|(code, rate)| (code.as_str(), rate.clone()))))
                },
            };
            Ok(source)
        })
        .collect()
}
