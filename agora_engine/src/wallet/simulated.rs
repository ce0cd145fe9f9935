use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use agora_common::Amount;
use async_trait::async_trait;
use log::*;
use secp256k1::{PublicKey, SecretKey};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    db_types::{OrderId, SpendInfo, WalletTransaction},
    helpers::{derive_child_secret, sign_digest, ChainCode, SECP},
    traits::{
        Balance,
        EscrowSignature,
        FeeLevel,
        MultisigAddress,
        TxInput,
        TxOutput,
        UnsignedTransaction,
        Wallet,
        WalletBatch,
        WalletError,
    },
    wallet::chain::{
        key_address,
        script_address,
        ChainEvent,
        MinedTransaction,
        RedeemScript,
        SimTransaction,
        SpentOutput,
        SimulatedChain,
        Witness,
        DUST_LIMIT,
    },
};

/// Addresses derived past the last used one while rescanning.
const GAP_LIMIT: u32 = 20;

fn fee_rate(level: FeeLevel) -> u64 {
    match level {
        FeeLevel::Economic => 1,
        FeeLevel::Normal => 2,
        FeeLevel::Priority => 5,
    }
}

fn spend_size(inputs: usize, outputs: usize) -> u64 {
    10 + 148 * inputs as u64 + 34 * outputs as u64
}

fn to_input(utxo: &SpentOutput) -> TxInput {
    TxInput { outpoint_id: utxo.outpoint_id.clone(), amount: utxo.amount.clone() }
}

#[derive(Default)]
struct WalletState {
    open: bool,
    keys: HashMap<String, SecretKey>,
    next_index: u32,
    current: Option<String>,
    labels: HashMap<String, OrderId>,
    watched: HashSet<String>,
}

/// A hierarchical-deterministic wallet on a [`SimulatedChain`]. All receiving keys are children of one master key,
/// so a wallet rebuilt from the same master and chaincode finds its coins again by rescanning.
#[derive(Clone)]
pub struct SimulatedWallet {
    chain: SimulatedChain,
    master: SecretKey,
    chaincode: ChainCode,
    birthday: u64,
    state: Arc<Mutex<WalletState>>,
    transactions: broadcast::Sender<WalletTransaction>,
    blocks: broadcast::Sender<u64>,
    shutdown: Arc<Mutex<Option<CancellationToken>>>,
}

impl SimulatedWallet {
    pub fn new(chain: SimulatedChain, master: SecretKey, chaincode: ChainCode, birthday: u64) -> Self {
        let (transactions, _) = broadcast::channel(256);
        let (blocks, _) = broadcast::channel(256);
        Self {
            chain,
            master,
            chaincode,
            birthday,
            state: Arc::new(Mutex::new(WalletState::default())),
            transactions,
            blocks,
            shutdown: Arc::new(Mutex::new(None)),
        }
    }

    /// Rebuilds the transaction and block channels with room for `capacity` undelivered events. Subscribers taken
    /// before the call keep the old channels.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.transactions = broadcast::channel(capacity).0;
        self.blocks = broadcast::channel(capacity).0;
        self
    }

    pub fn random(chain: SimulatedChain) -> Self {
        let master = SecretKey::new(&mut rand::thread_rng());
        Self::new(chain, master, ChainCode::random(), 0)
    }

    pub fn chain(&self) -> &SimulatedChain {
        &self.chain
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WalletState>, WalletError> {
        self.state.lock().map_err(|_| WalletError::Backend("wallet state is poisoned".into()))
    }

    fn derive(&self, state: &mut WalletState) -> Result<String, WalletError> {
        let index = state.next_index;
        let key = derive_child_secret(&self.master, &self.chaincode, index)
            .map_err(|e| WalletError::Backend(e.to_string()))?;
        let address = key_address(self.chain.coin(), &PublicKey::from_secret_key(&SECP, &key));
        state.keys.insert(address.clone(), key);
        state.next_index += 1;
        Ok(address)
    }

    fn owned_addresses(&self) -> Result<HashSet<String>, WalletError> {
        Ok(self.lock()?.keys.keys().cloned().collect())
    }

    fn ensure_open(&self) -> Result<(), WalletError> {
        if self.lock()?.open {
            Ok(())
        } else {
            Err(WalletError::NotOpen)
        }
    }

    fn convert(&self, tx: &MinedTransaction) -> WalletTransaction {
        let (owned, watched) = match self.state.lock() {
            Ok(s) => (s.keys.keys().cloned().collect::<HashSet<_>>(), s.watched.clone()),
            Err(_) => (HashSet::new(), HashSet::new()),
        };
        let info = |outpoint_id: String, address: &str, amount: &Amount| SpendInfo {
            outpoint_id,
            address: address.to_string(),
            amount: amount.clone(),
            is_relevant: owned.contains(address),
            is_watched: watched.contains(address),
        };
        WalletTransaction {
            id: tx.txid.clone(),
            from: tx.inputs.iter().map(|i| info(i.outpoint_id.clone(), &i.address, &i.amount)).collect(),
            to: tx
                .outputs
                .iter()
                .enumerate()
                .map(|(n, o)| info(format!("{}:{n}", tx.txid), &o.address, &o.amount))
                .collect(),
            height: tx.height,
        }
    }

    fn is_interesting(&self, tx: &MinedTransaction) -> bool {
        match self.state.lock() {
            Ok(s) => {
                tx.inputs.iter().map(|i| &i.address).chain(tx.outputs.iter().map(|o| &o.address)).any(|a| {
                    s.keys.contains_key(a) || s.watched.contains(a)
                })
            },
            Err(_) => false,
        }
    }

    /// Outputs the wallet may spend in `batch`, skipping any that an earlier transaction in the batch already uses.
    fn spendable(&self, batch: &WalletBatch) -> Result<Vec<SpentOutput>, WalletError> {
        let reserved = batch
            .transactions()
            .iter()
            .filter_map(|raw| SimTransaction::from_raw(raw).ok())
            .flat_map(|t| t.unsigned.inputs.into_iter().map(|i| i.outpoint_id))
            .collect::<HashSet<_>>();
        let owned = self.owned_addresses()?;
        Ok(self.chain.unspent_for(&owned).into_iter().filter(|u| !reserved.contains(&u.outpoint_id)).collect())
    }

    fn sign_key_spend(
        &self,
        unsigned: UnsignedTransaction,
        spent: &[SpentOutput],
    ) -> Result<SimTransaction, WalletError> {
        let state = self.lock()?;
        let witnesses = spent
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let key = state.keys.get(&s.address).ok_or_else(|| WalletError::InvalidAddress(s.address.clone()))?;
                let public_key = PublicKey::from_secret_key(&SECP, key).to_string();
                Ok(Witness::Key { public_key, signature: sign_digest(key, unsigned.sighash(i)) })
            })
            .collect::<Result<Vec<_>, WalletError>>()?;
        Ok(SimTransaction { unsigned, witnesses, nonce: 0 })
    }

    fn rescan(&self) -> Result<(), WalletError> {
        let history = self
            .chain
            .transactions_since(self.birthday)
            .into_iter()
            .flat_map(|t| t.outputs.into_iter().map(|o| o.address))
            .collect::<HashSet<_>>();
        let mut state = self.lock()?;
        state.next_index = 0;
        let mut next_unused = 0;
        while state.next_index < next_unused + GAP_LIMIT {
            let address = self.derive(&mut state)?;
            if history.contains(&address) {
                next_unused = state.next_index;
            }
        }
        // The gap keys stay known, but are handed out again from the first unused index
        state.next_index = next_unused;
        state.current = None;
        debug!("👛️ Rescan from height {} found {next_unused} used addresses", self.birthday);
        Ok(())
    }
}

#[async_trait]
impl Wallet for SimulatedWallet {
    fn coin(&self) -> &str {
        self.chain.coin()
    }

    async fn open(&self) -> Result<(), WalletError> {
        if self.lock()?.open {
            return Ok(());
        }
        self.rescan()?;
        let token = CancellationToken::new();
        let mut events = self.chain.subscribe();
        let wallet = self.clone();
        let stop = token.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    ev = events.recv() => ev,
                };
                match event {
                    Ok(ChainEvent::Mined(tx)) => {
                        if wallet.is_interesting(&tx) {
                            trace!("👛️ Wallet saw transaction {}", tx.txid);
                            let _ = wallet.transactions.send(wallet.convert(&tx));
                        }
                    },
                    Ok(ChainEvent::Block(height)) => {
                        let _ = wallet.blocks.send(height);
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("👛️ Wallet missed {n} chain events"),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("👛️ Wallet subscription closed");
        });
        if let Ok(mut slot) = self.shutdown.lock() {
            *slot = Some(token);
        }
        self.lock()?.open = true;
        info!("👛️ {} wallet open at height {}", self.coin(), self.chain.height());
        Ok(())
    }

    async fn close(&self) -> Result<(), WalletError> {
        if let Some(token) = self.shutdown.lock().ok().and_then(|mut s| s.take()) {
            token.cancel();
        }
        self.lock()?.open = false;
        Ok(())
    }

    async fn current_address(&self) -> Result<String, WalletError> {
        let mut state = self.lock()?;
        match state.current.clone() {
            Some(address) => Ok(address),
            None => {
                let address = self.derive(&mut state)?;
                state.current = Some(address.clone());
                Ok(address)
            },
        }
    }

    async fn new_address(&self, order_id: Option<&OrderId>) -> Result<String, WalletError> {
        let mut state = self.lock()?;
        let address = self.derive(&mut state)?;
        state.current = Some(address.clone());
        if let Some(id) = order_id {
            state.labels.insert(address.clone(), id.clone());
        }
        Ok(address)
    }

    async fn balance(&self) -> Result<Balance, WalletError> {
        let owned = self.owned_addresses()?;
        let confirmed = self.chain.unspent_for(&owned).iter().map(|u| &u.amount).sum();
        // Every transaction is mined on submission
        Ok(Balance { confirmed, unconfirmed: Amount::zero() })
    }

    async fn spend(
        &self,
        batch: &mut WalletBatch,
        to: &str,
        amount: &Amount,
        fee_level: FeeLevel,
    ) -> Result<String, WalletError> {
        self.ensure_open()?;
        if to.is_empty() {
            return Err(WalletError::InvalidAddress(to.to_string()));
        }
        if self.is_dust(amount) {
            return Err(WalletError::DustAmount(amount.clone()));
        }
        let rate = fee_rate(fee_level);
        let available = self.spendable(batch)?;
        let mut selected = Vec::new();
        let mut total = Amount::zero();
        for utxo in available.iter() {
            total += utxo.amount.clone();
            selected.push(utxo.clone());
            let fee = Amount::from(rate * spend_size(selected.len(), 2));
            if total >= amount.clone() + fee {
                break;
            }
        }
        let fee = Amount::from(rate * spend_size(selected.len(), 2));
        let needed = amount.clone() + fee.clone();
        if total < needed {
            return Err(WalletError::InsufficientFunds { needed, available: total });
        }
        let mut outputs = vec![TxOutput { address: to.to_string(), amount: amount.clone() }];
        let change = total - needed;
        if !self.is_dust(&change) {
            let change_address = {
                let mut state = self.lock()?;
                self.derive(&mut state)?
            };
            outputs.push(TxOutput { address: change_address, amount: change });
        }
        let unsigned = UnsignedTransaction {
            inputs: selected.iter().map(to_input).collect(),
            outputs,
            lock_height: 0,
        };
        let tx = self.sign_key_spend(unsigned, &selected)?;
        let txid = tx.txid();
        batch.push_transaction(tx.to_raw()?);
        debug!("👛️ Prepared spend of {amount} to {to} as {txid}");
        Ok(txid)
    }

    async fn sweep_wallet(
        &self,
        batch: &mut WalletBatch,
        to: &str,
        fee_level: FeeLevel,
    ) -> Result<String, WalletError> {
        self.ensure_open()?;
        let available = self.spendable(batch)?;
        let total: Amount = available.iter().map(|u| &u.amount).sum();
        let fee = Amount::from(fee_rate(fee_level) * spend_size(available.len(), 1));
        let amount = total.clone() - fee;
        if self.is_dust(&amount) {
            return Err(WalletError::DustAmount(amount));
        }
        let unsigned = UnsignedTransaction {
            inputs: available.iter().map(to_input).collect(),
            outputs: vec![TxOutput { address: to.to_string(), amount }],
            lock_height: 0,
        };
        let tx = self.sign_key_spend(unsigned, &available)?;
        let txid = tx.txid();
        batch.push_transaction(tx.to_raw()?);
        Ok(txid)
    }

    async fn commit(&self, batch: WalletBatch) -> Result<Vec<String>, WalletError> {
        {
            let mut state = self.lock()?;
            state.watched.extend(batch.watched().iter().cloned());
        }
        let mut txids = Vec::with_capacity(batch.transactions().len());
        for raw in batch.transactions() {
            txids.push(self.chain.submit(raw)?);
        }
        Ok(txids)
    }

    async fn create_multisig_address(
        &self,
        keys: &[PublicKey],
        threshold: u32,
    ) -> Result<MultisigAddress, WalletError> {
        let redeem_script = RedeemScript::new(keys, threshold, None)?.to_bytes()?;
        Ok(MultisigAddress { address: script_address(self.coin(), &redeem_script), redeem_script })
    }

    async fn create_multisig_with_timeout(
        &self,
        keys: &[PublicKey],
        threshold: u32,
        timeout_blocks: u64,
        timeout_key: &PublicKey,
    ) -> Result<MultisigAddress, WalletError> {
        let redeem_script = RedeemScript::new(keys, threshold, Some((timeout_blocks, timeout_key)))?.to_bytes()?;
        Ok(MultisigAddress { address: script_address(self.coin(), &redeem_script), redeem_script })
    }

    async fn sign_multisig_transaction(
        &self,
        txn: &UnsignedTransaction,
        key: &SecretKey,
        redeem_script: &[u8],
    ) -> Result<Vec<EscrowSignature>, WalletError> {
        let script = RedeemScript::from_bytes(redeem_script)?;
        let public = PublicKey::from_secret_key(&SECP, key).to_string();
        let is_timeout_key = script.timeout.as_ref().map(|t| t.key == public).unwrap_or(false);
        if !script.keys.contains(&public) && !is_timeout_key {
            return Err(WalletError::InvalidRedeemScript("signing key is not part of the script".into()));
        }
        Ok((0..txn.inputs.len())
            .map(|i| EscrowSignature { input_index: i as u32, signature: sign_digest(key, txn.sighash(i)) })
            .collect())
    }

    async fn build_and_send(
        &self,
        batch: &mut WalletBatch,
        txn: &UnsignedTransaction,
        signatures: &[EscrowSignature],
        redeem_script: &[u8],
    ) -> Result<String, WalletError> {
        let tx = SimTransaction::script_witness(txn.clone(), signatures, redeem_script);
        let raw = tx.to_raw()?;
        self.chain.check(&raw)?;
        let txid = tx.txid();
        batch.push_transaction(raw);
        Ok(txid)
    }

    async fn watch_address(&self, batch: &mut WalletBatch, address: &str) -> Result<(), WalletError> {
        batch.push_watch(address.to_string());
        Ok(())
    }

    async fn get_transaction(&self, txid: &str) -> Result<Option<WalletTransaction>, WalletError> {
        Ok(self.chain.transaction(txid).map(|t| self.convert(&t)))
    }

    async fn transactions_for_address(&self, address: &str) -> Result<Vec<WalletTransaction>, WalletError> {
        Ok(self.chain.transactions_for(address).iter().map(|t| self.convert(t)).collect())
    }

    fn subscribe_transactions(&self) -> broadcast::Receiver<WalletTransaction> {
        self.transactions.subscribe()
    }

    fn subscribe_blocks(&self) -> broadcast::Receiver<u64> {
        self.blocks.subscribe()
    }

    async fn estimate_spend_fee(&self, _amount: &Amount, fee_level: FeeLevel) -> Result<Amount, WalletError> {
        Ok(Amount::from(fee_rate(fee_level) * spend_size(1, 2)))
    }

    async fn estimate_escrow_fee(&self, threshold: u32, fee_level: FeeLevel) -> Result<Amount, WalletError> {
        let size = 10 + 34 * 2 + 41 + 73 * threshold as u64 + 34 * 3;
        Ok(Amount::from(fee_rate(fee_level) * size))
    }

    fn is_dust(&self, amount: &Amount) -> bool {
        amount < &Amount::from(DUST_LIMIT)
    }

    async fn chain_height(&self) -> Result<u64, WalletError> {
        Ok(self.chain.height())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    async fn funded_wallet(chain: &SimulatedChain, amount: u64) -> SimulatedWallet {
        let wallet = SimulatedWallet::random(chain.clone());
        wallet.open().await.unwrap();
        let address = wallet.current_address().await.unwrap();
        chain.fund(&address, Amount::from(amount)).unwrap();
        wallet
    }

    #[tokio::test]
    async fn spend_and_change() {
        let chain = SimulatedChain::new("TBTC");
        let alice = funded_wallet(&chain, 100_000).await;
        let bob = SimulatedWallet::random(chain.clone());
        bob.open().await.unwrap();
        let to = bob.new_address(None).await.unwrap();
        let mut batch = WalletBatch::new();
        let txid = alice.spend(&mut batch, &to, &Amount::from(40_000u64), FeeLevel::Normal).await.unwrap();
        // Nothing moves until the batch is committed
        assert_eq!(bob.balance().await.unwrap().confirmed, Amount::zero());
        let sent = alice.commit(batch).await.unwrap();
        assert_eq!(sent, vec![txid.clone()]);
        assert_eq!(bob.balance().await.unwrap().confirmed, Amount::from(40_000u64));
        let fee = alice.estimate_spend_fee(&Amount::from(40_000u64), FeeLevel::Normal).await.unwrap();
        assert_eq!(alice.balance().await.unwrap().confirmed, Amount::from(60_000u64) - fee);
        let tx = bob.get_transaction(&txid).await.unwrap().unwrap();
        assert!(tx.to.iter().any(|s| s.address == to && s.is_relevant));
    }

    #[tokio::test]
    async fn dust_and_insufficient_funds() {
        let chain = SimulatedChain::new("TBTC");
        let alice = funded_wallet(&chain, 1_000).await;
        let mut batch = WalletBatch::new();
        let err = alice.spend(&mut batch, "tbtcksomewhere", &Amount::from(545u64), FeeLevel::Economic).await;
        assert!(matches!(err, Err(WalletError::DustAmount(_))));
        let err = alice.spend(&mut batch, "tbtcksomewhere", &Amount::from(5_000u64), FeeLevel::Economic).await;
        assert!(matches!(err, Err(WalletError::InsufficientFunds { .. })));
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn subscriptions_report_watched_addresses() {
        let chain = SimulatedChain::new("TBTC");
        let wallet = SimulatedWallet::random(chain.clone());
        wallet.open().await.unwrap();
        let mut txs = wallet.subscribe_transactions();
        let mut batch = WalletBatch::new();
        wallet.watch_address(&mut batch, "tbtcswatched").await.unwrap();
        wallet.commit(batch).await.unwrap();
        chain.fund("tbtcsunrelated", Amount::from(700u64)).unwrap();
        let txid = chain.fund("tbtcswatched", Amount::from(900u64)).unwrap();
        let tx = tokio::time::timeout(Duration::from_secs(2), txs.recv()).await.unwrap().unwrap();
        assert_eq!(tx.id, txid);
        assert!(tx.to[0].is_watched);
        assert!(!tx.to[0].is_relevant);
    }

    #[tokio::test]
    async fn sweep_empties_the_wallet() {
        let chain = SimulatedChain::new("TBTC");
        let wallet = funded_wallet(&chain, 10_000).await;
        chain.fund(&wallet.new_address(None).await.unwrap(), Amount::from(5_000u64)).unwrap();
        let mut batch = WalletBatch::new();
        wallet.sweep_wallet(&mut batch, "tbtckdestination", FeeLevel::Economic).await.unwrap();
        wallet.commit(batch).await.unwrap();
        assert!(wallet.balance().await.unwrap().confirmed.is_zero());
        assert_eq!(chain.balance_of("tbtckdestination"), Amount::from(15_000 - spend_size(2, 1)));
    }

    #[tokio::test]
    async fn restored_wallet_finds_its_coins() {
        let chain = SimulatedChain::new("TBTC");
        let master = SecretKey::new(&mut rand::thread_rng());
        let chaincode = ChainCode::random();
        let original = SimulatedWallet::new(chain.clone(), master, chaincode, 0);
        original.open().await.unwrap();
        for _ in 0..3 {
            let address = original.new_address(None).await.unwrap();
            chain.fund(&address, Amount::from(1_000u64)).unwrap();
        }
        original.close().await.unwrap();
        let restored = SimulatedWallet::new(chain.clone(), master, chaincode, 0);
        restored.open().await.unwrap();
        assert_eq!(restored.balance().await.unwrap().confirmed, Amount::from(3_000u64));
    }
}
