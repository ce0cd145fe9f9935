use std::{env, io::Write, path::PathBuf, time::Duration};

use agora_common::{parse_decimal_rational, Secret};
use agora_engine::{
    exchange_rates::DEFAULT_RATE_TTL,
    helpers::NodeIdentity,
    messenger::MessengerConfig,
    OrderFlowConfig,
};
use log::*;
use num_rational::BigRational;
use serde_json::json;
use tempfile::NamedTempFile;

use crate::errors::NodeError;

const DEFAULT_DATABASE_URL: &str = "sqlite://data/agora_store.db";
const DEFAULT_PUBLIC_DATA_DIR: &str = "data/public";
const DEFAULT_WALLET_COIN: &str = "TBTC";
const DEFAULT_RATE_SOURCE: &str = "https://blockchain.info/ticker";
const DEFAULT_DIRECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub database_url: String,
    /// Where the node keeps the files it publishes, such as its rating index.
    pub public_data_dir: PathBuf,
    pub keys: KeyConfig,
    pub wallet: WalletConfig,
    pub exchange_rate_sources: Vec<RateSourceConfig>,
    pub exchange_rate_ttl: Duration,
    pub messenger: MessengerConfig,
    /// How long a direct send to a peer may take before the messenger falls back to the peer's inboxes.
    pub direct_connect_timeout: Duration,
    /// How often the public data directory is re-hashed and published.
    pub publish_interval: Duration,
    pub price_tolerance: BigRational,
    /// If true, the node assumes the database schema is already current.
    pub skip_migrations: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            public_data_dir: PathBuf::from(DEFAULT_PUBLIC_DATA_DIR),
            keys: KeyConfig::default(),
            wallet: WalletConfig::default(),
            exchange_rate_sources: vec![RateSourceConfig::Http(DEFAULT_RATE_SOURCE.to_string())],
            exchange_rate_ttl: DEFAULT_RATE_TTL,
            messenger: MessengerConfig::default(),
            direct_connect_timeout: DEFAULT_DIRECT_CONNECT_TIMEOUT,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            price_tolerance: OrderFlowConfig::default().price_tolerance,
            skip_migrations: false,
        }
    }
}

impl NodeConfig {
    pub fn from_env_or_default() -> Self {
        let database_url = env::var("AGORA_DATABASE_URL").ok().unwrap_or_else(|| {
            warn!("🪛️ AGORA_DATABASE_URL is not set. Using the default, {DEFAULT_DATABASE_URL}.");
            DEFAULT_DATABASE_URL.into()
        });
        let public_data_dir =
            env::var("AGORA_PUBLIC_DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| DEFAULT_PUBLIC_DATA_DIR.into());
        let keys = KeyConfig::try_from_env().unwrap_or_else(|e| {
            warn!("🪛️ Could not load the node's keys from environment variables. {e}. Generating new ones.");
            KeyConfig::default()
        });
        let wallet = WalletConfig::from_env_or_default();
        let exchange_rate_sources = env::var("AGORA_EXCHANGE_RATE_SOURCES")
            .map(|s| parse_rate_sources(&s))
            .unwrap_or_else(|_| vec![RateSourceConfig::Http(DEFAULT_RATE_SOURCE.to_string())]);
        if exchange_rate_sources.is_empty() {
            error!("🪛️ No usable exchange rate sources are configured. The node will not be able to quote prices.");
        }
        let exchange_rate_ttl = duration_from_env("AGORA_EXCHANGE_RATE_TTL", DEFAULT_RATE_TTL);
        let defaults = MessengerConfig::default();
        let retry_base = duration_from_env("AGORA_MESSENGER_RETRY_BASE", defaults.retry_base);
        let mut retry_cap = duration_from_env("AGORA_MESSENGER_RETRY_CAP", defaults.retry_cap);
        if retry_cap < retry_base {
            warn!("🪛️ AGORA_MESSENGER_RETRY_CAP is shorter than the retry base. Using the base as the cap.");
            retry_cap = retry_base;
        }
        let messenger = MessengerConfig { retry_base, retry_cap, ..defaults };
        let direct_connect_timeout = duration_from_env("AGORA_DIRECT_CONNECT_TIMEOUT", DEFAULT_DIRECT_CONNECT_TIMEOUT);
        let publish_interval = duration_from_env("AGORA_PUBLISH_INTERVAL", DEFAULT_PUBLISH_INTERVAL);
        let price_tolerance = env::var("AGORA_PRICE_TOLERANCE")
            .ok()
            .and_then(|s| {
                let tolerance = parse_decimal_rational(&s).filter(|t| t >= &BigRational::from_integer(0.into()));
                if tolerance.is_none() {
                    warn!("🪛️ {s} is not a valid value for AGORA_PRICE_TOLERANCE. Using the default instead.");
                }
                tolerance
            })
            .unwrap_or_else(|| OrderFlowConfig::default().price_tolerance);
        let skip_migrations = env::var("AGORA_SKIP_MIGRATIONS").map(|s| &s == "1" || &s == "true").unwrap_or(false);
        Self {
            database_url,
            public_data_dir,
            keys,
            wallet,
            exchange_rate_sources,
            exchange_rate_ttl,
            messenger,
            direct_connect_timeout,
            publish_interval,
            price_tolerance,
            skip_migrations,
        }
    }

    pub fn order_flow_config(&self) -> OrderFlowConfig {
        OrderFlowConfig { price_tolerance: self.price_tolerance.clone(), ..OrderFlowConfig::default() }
    }
}

/// Reads a number of seconds from `var`, falling back to `default` when it is missing or invalid.
fn duration_from_env(var: &str, default: Duration) -> Duration {
    env::var(var)
        .map_err(|_| debug!("🪛️ {var} is not set. Using the default value of {}s.", default.as_secs()))
        .and_then(|s| {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| warn!("🪛️ Invalid configuration value for {var}. {e}"))
        })
        .ok()
        .unwrap_or(default)
}

//-------------------------------------------------  KeyConfig  --------------------------------------------------------
/// The node's identity, escrow and rating secret keys, hex encoded.
#[derive(Clone, Debug)]
pub struct KeyConfig {
    pub identity_key: Secret<String>,
    pub escrow_key: Secret<String>,
    pub rating_key: Secret<String>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        warn!(
            "🚨️🚨️🚨️ The node's keys have not been set. I'm using random keys for this session. Orders, escrows and \
             funds made with them are lost once the node stops unless you keep these keys. 🚨️🚨️🚨️"
        );
        let [identity_key, escrow_key, rating_key] = NodeIdentity::random().to_hex_keys();
        let mut tmpfile = NamedTempFile::new().ok().and_then(|f| f.keep().ok());
        match &mut tmpfile {
            Some((f, p)) => {
                let key_data = json!({
                    "AGORA_IDENTITY_KEY": identity_key.reveal(),
                    "AGORA_ESCROW_KEY": escrow_key.reveal(),
                    "AGORA_RATING_KEY": rating_key.reveal(),
                })
                .to_string();
                match writeln!(f, "{key_data}") {
                    Ok(()) => warn!(
                        "🚨️🚨️🚨️ The keys for this session were written to {}. Set AGORA_IDENTITY_KEY, \
                         AGORA_ESCROW_KEY and AGORA_RATING_KEY to keep using them. 🚨️🚨️🚨️",
                        p.to_str().unwrap_or("???")
                    ),
                    Err(e) => warn!("🪛️ Could not write the session keys to the temporary file. {e}"),
                }
            },
            None => {
                warn!("🪛️ Could not create a temporary file to store the session keys.");
            },
        }
        Self { identity_key, escrow_key, rating_key }
    }
}

impl KeyConfig {
    pub fn try_from_env() -> Result<Self, NodeError> {
        let read = |var: &str| {
            env::var(var).map(Secret::new).map_err(|e| NodeError::ConfigurationError(format!("{e} [{var}]")))
        };
        let keys = Self {
            identity_key: read("AGORA_IDENTITY_KEY")?,
            escrow_key: read("AGORA_ESCROW_KEY")?,
            rating_key: read("AGORA_RATING_KEY")?,
        };
        // Fail here rather than at startup, so that the fallback above can kick in
        keys.identity()?;
        Ok(keys)
    }

    pub fn identity(&self) -> Result<NodeIdentity, NodeError> {
        let identity =
            NodeIdentity::from_hex_keys(
                self.identity_key.reveal(),
                self.escrow_key.reveal(),
                self.rating_key.reveal(),
            )?;
        Ok(identity)
    }
}

//-------------------------------------------------  WalletConfig  -----------------------------------------------------
#[derive(Clone, Debug)]
pub struct WalletConfig {
    /// One wallet is opened per coin code.
    pub coins: Vec<String>,
    /// The first block height the wallet scans from.
    pub birthday: u64,
    /// Mixed into the wallet seed together with the escrow key.
    pub password: Secret<String>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self { coins: vec![DEFAULT_WALLET_COIN.to_string()], birthday: 0, password: Secret::default() }
    }
}

impl WalletConfig {
    pub fn from_env_or_default() -> Self {
        let coins = env::var("AGORA_WALLET_COINS")
            .map(|s| {
                s.split(',').map(|c| c.trim().to_ascii_uppercase()).filter(|c| !c.is_empty()).collect::<Vec<_>>()
            })
            .unwrap_or_else(|_| {
                info!("🪛️ AGORA_WALLET_COINS is not set. Using {DEFAULT_WALLET_COIN}.");
                vec![DEFAULT_WALLET_COIN.to_string()]
            });
        if coins.is_empty() {
            error!("🪛️ AGORA_WALLET_COINS lists no coins. The node will not be able to take part in orders.");
        }
        let birthday = env::var("AGORA_WALLET_BIRTHDAY")
            .map(|s| {
                s.parse::<u64>().unwrap_or_else(|e| {
                    error!("🪛️ {s} is not a valid block height for AGORA_WALLET_BIRTHDAY. {e} Scanning from 0.");
                    0
                })
            })
            .unwrap_or(0);
        let password = env::var("AGORA_WALLET_PASSWORD").map(Secret::new).unwrap_or_default();
        Self { coins, birthday, password }
    }
}

//-------------------------------------------------  RateSourceConfig  -------------------------------------------------
#[derive(Clone, Debug, PartialEq)]
pub enum RateSourceConfig {
    /// A JSON ticker endpoint.
    Http(String),
    /// Fixed reserve-currency rates, written `static:USD=50000;EUR=46000`.
    Static(Vec<(String, BigRational)>),
}

/// Parses the comma separated `AGORA_EXCHANGE_RATE_SOURCES` list. Entries that can't be understood are skipped.
pub fn parse_rate_sources(s: &str) -> Vec<RateSourceConfig> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.strip_prefix("static:") {
            Some(table) => {
                let rates = table
                    .split(';')
                    .map(|pair| {
                        let (code, rate) = pair.split_once('=')?;
                        let rate = parse_decimal_rational(rate)?;
                        Some((code.trim().to_ascii_uppercase(), rate))
                    })
                    .collect::<Option<Vec<_>>>();
                if rates.is_none() {
                    warn!("🪛️ Ignoring invalid static rate table ({table}) in AGORA_EXCHANGE_RATE_SOURCES");
                }
                rates.map(RateSourceConfig::Static)
            },
            None if entry.starts_with("http://") || entry.starts_with("https://") => {
                Some(RateSourceConfig::Http(entry.to_string()))
            },
            None => {
                warn!("🪛️ Ignoring invalid exchange rate source ({entry}) in AGORA_EXCHANGE_RATE_SOURCES");
                None
            },
        })
        .collect()
}
