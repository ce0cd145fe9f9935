use std::{collections::HashMap, sync::Arc};

use log::*;

use crate::traits::{Wallet, WalletError};

/// The wallets a node runs, keyed by coin.
///
/// Lookups are case-insensitive, and a testnet code (`TBTC`) falls back to the mainnet wallet kind (`BTC`) and
/// vice versa, so an order quoting either form reaches the one wallet configured for that coin.
#[derive(Clone, Default)]
pub struct MultiWallet {
    wallets: HashMap<String, Arc<dyn Wallet>>,
}

impl MultiWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, wallet: Arc<dyn Wallet>) -> &mut Self {
        let coin = wallet.coin().to_uppercase();
        debug!("👛️ Registered wallet for {coin}");
        self.wallets.insert(coin, wallet);
        self
    }

    pub fn with_wallet(mut self, wallet: Arc<dyn Wallet>) -> Self {
        self.add(wallet);
        self
    }

    pub fn wallet_for(&self, coin: &str) -> Result<Arc<dyn Wallet>, WalletError> {
        let code = coin.to_uppercase();
        if let Some(w) = self.wallets.get(&code) {
            return Ok(Arc::clone(w));
        }
        let twin = match code.strip_prefix('T') {
            Some(base) => base.to_string(),
            None => format!("T{code}"),
        };
        self.wallets.get(&twin).cloned().ok_or(WalletError::UnsupportedCoin(code))
    }

    pub fn coins(&self) -> Vec<String> {
        let mut coins = self.wallets.keys().cloned().collect::<Vec<_>>();
        coins.sort();
        coins
    }

    pub fn wallets(&self) -> impl Iterator<Item = &Arc<dyn Wallet>> {
        self.wallets.values()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    pub async fn open_all(&self) -> Result<(), WalletError> {
        for wallet in self.wallets.values() {
            wallet.open().await?;
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        for (coin, wallet) in &self.wallets {
            if let Err(e) = wallet.close().await {
                warn!("👛️ Could not close the {coin} wallet cleanly. {e}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wallet::{SimulatedChain, SimulatedWallet};

    #[test]
    fn testnet_codes_share_a_wallet() {
        let btc = Arc::new(SimulatedWallet::random(SimulatedChain::new("TBTC")));
        let ltc = Arc::new(SimulatedWallet::random(SimulatedChain::new("ltc")));
        let wallets = MultiWallet::new().with_wallet(btc).with_wallet(ltc);
        assert_eq!(wallets.coins(), vec!["LTC".to_string(), "TBTC".to_string()]);
        assert_eq!(wallets.wallet_for("tbtc").unwrap().coin(), "TBTC");
        assert_eq!(wallets.wallet_for("BTC").unwrap().coin(), "TBTC");
        assert_eq!(wallets.wallet_for("TLTC").unwrap().coin(), "LTC");
        assert!(matches!(wallets.wallet_for("ZEC"), Err(WalletError::UnsupportedCoin(_))));
    }
}
