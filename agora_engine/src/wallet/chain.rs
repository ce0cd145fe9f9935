//! An in-memory ledger shared by every [`SimulatedWallet`](crate::wallet::SimulatedWallet) of one coin.
//!
//! Every submitted transaction is mined straight away into its own block. Outputs are locked either to a single key
//! (`<coin>k…` addresses) or to a redeem script (`<coin>s…` addresses); the address is a hash of the key or script, so
//! a spender has to reveal it, and the ledger checks ECDSA signatures against it before accepting a spend.
use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::{Arc, Mutex},
};

use agora_common::Amount;
use log::*;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    helpers::{hashing::blake2b_hex, verify_digest},
    traits::{EscrowSignature, TxOutput, UnsignedTransaction, WalletError},
};

pub const DUST_LIMIT: u64 = 546;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutPath {
    /// Confirmations the escrowed output needs before the timeout key may spend alone.
    pub blocks: u64,
    pub key: String,
}

/// An m-of-n key set with an optional single-key escape after a relative time lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemScript {
    pub threshold: u32,
    /// Compressed public keys, hex, sorted.
    pub keys: Vec<String>,
    pub timeout: Option<TimeoutPath>,
}

impl RedeemScript {
    pub fn new(keys: &[PublicKey], threshold: u32, timeout: Option<(u64, &PublicKey)>) -> Result<Self, WalletError> {
        let mut keys = keys.iter().map(|k| k.to_string()).collect::<Vec<_>>();
        keys.sort();
        keys.dedup();
        if threshold == 0 || threshold as usize > keys.len() {
            return Err(WalletError::InvalidRedeemScript(format!(
                "threshold {threshold} is impossible with {} keys",
                keys.len()
            )));
        }
        let timeout = timeout.map(|(blocks, key)| TimeoutPath { blocks, key: key.to_string() });
        Ok(Self { threshold, keys, timeout })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WalletError> {
        serde_json::to_vec(self).map_err(|e| WalletError::InvalidRedeemScript(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        serde_json::from_slice(bytes).map_err(|e| WalletError::InvalidRedeemScript(e.to_string()))
    }

    pub fn public_keys(&self) -> Result<Vec<PublicKey>, WalletError> {
        self.keys
            .iter()
            .map(|k| PublicKey::from_str(k).map_err(|e| WalletError::InvalidRedeemScript(e.to_string())))
            .collect()
    }

    pub fn timeout_key(&self) -> Result<Option<(u64, PublicKey)>, WalletError> {
        self.timeout
            .as_ref()
            .map(|t| {
                PublicKey::from_str(&t.key)
                    .map(|k| (t.blocks, k))
                    .map_err(|e| WalletError::InvalidRedeemScript(e.to_string()))
            })
            .transpose()
    }
}

pub fn key_address(coin: &str, key: &PublicKey) -> String {
    format!("{}k{}", coin.to_lowercase(), &blake2b_hex(&key.serialize())[..40])
}

pub fn script_address(coin: &str, script: &[u8]) -> String {
    format!("{}s{}", coin.to_lowercase(), &blake2b_hex(script)[..40])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Witness {
    Key { public_key: String, signature: String },
    Script { redeem_script: String, signatures: Vec<String> },
}

/// The raw form a simulated transaction takes inside a [`WalletBatch`](crate::traits::WalletBatch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimTransaction {
    pub unsigned: UnsignedTransaction,
    pub witnesses: Vec<Witness>,
    /// Distinguishes faucet payments, which have no inputs.
    pub nonce: u64,
}

impl SimTransaction {
    pub fn txid(&self) -> String {
        let bytes = serde_json::to_vec(&(&self.unsigned, self.nonce)).unwrap_or_default();
        blake2b_hex(&bytes)
    }

    pub fn to_raw(&self) -> Result<Vec<u8>, WalletError> {
        serde_json::to_vec(self).map_err(|e| WalletError::Backend(e.to_string()))
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self, WalletError> {
        serde_json::from_slice(raw).map_err(|e| WalletError::Backend(format!("malformed raw transaction: {e}")))
    }

    pub fn script_witness(unsigned: UnsignedTransaction, signatures: &[EscrowSignature], redeem_script: &[u8]) -> Self {
        let witnesses = (0..unsigned.inputs.len())
            .map(|i| Witness::Script {
                redeem_script: hex::encode(redeem_script),
                signatures: signatures
                    .iter()
                    .filter(|s| s.input_index as usize == i)
                    .map(|s| s.signature.clone())
                    .collect(),
            })
            .collect();
        Self { unsigned, witnesses, nonce: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutput {
    pub outpoint_id: String,
    pub address: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedTransaction {
    pub txid: String,
    pub inputs: Vec<SpentOutput>,
    pub outputs: Vec<TxOutput>,
    pub height: u64,
}

impl MinedTransaction {
    pub fn touches(&self, address: &str) -> bool {
        self.inputs.iter().any(|i| i.address == address) || self.outputs.iter().any(|o| o.address == address)
    }
}

#[derive(Debug, Clone)]
pub enum ChainEvent {
    Mined(MinedTransaction),
    Block(u64),
}

#[derive(Debug, Clone)]
struct Utxo {
    address: String,
    amount: Amount,
    height: u64,
}

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    utxos: HashMap<String, Utxo>,
    spent: HashSet<String>,
    transactions: Vec<MinedTransaction>,
    faucet_nonce: u64,
}

#[derive(Debug, Clone)]
pub struct SimulatedChain {
    coin: String,
    state: Arc<Mutex<ChainState>>,
    events: broadcast::Sender<ChainEvent>,
}

impl SimulatedChain {
    pub fn new(coin: &str) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { coin: coin.to_uppercase(), state: Arc::new(Mutex::new(ChainState::default())), events }
    }

    pub fn coin(&self) -> &str {
        self.coin.as_str()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ChainState>, WalletError> {
        self.state.lock().map_err(|_| WalletError::Backend("simulated chain state is poisoned".into()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn height(&self) -> u64 {
        self.lock().map(|s| s.height).unwrap_or_default()
    }

    pub fn mine_blocks(&self, n: u64) -> Result<u64, WalletError> {
        let heights = {
            let mut state = self.lock()?;
            (0..n)
                .map(|_| {
                    state.height += 1;
                    state.height
                })
                .collect::<Vec<_>>()
        };
        for h in &heights {
            let _ = self.events.send(ChainEvent::Block(*h));
        }
        Ok(self.height())
    }

    /// Pays `amount` out of thin air to `address` and mines it.
    pub fn fund(&self, address: &str, amount: Amount) -> Result<String, WalletError> {
        let tx = {
            let mut state = self.lock()?;
            state.faucet_nonce += 1;
            let sim = SimTransaction {
                unsigned: UnsignedTransaction {
                    inputs: vec![],
                    outputs: vec![TxOutput { address: address.to_string(), amount }],
                    lock_height: 0,
                },
                witnesses: vec![],
                nonce: state.faucet_nonce,
            };
            Self::apply(&mut state, &sim, vec![])
        };
        debug!("👛️ Faucet paid {} into {address}", tx.outputs[0].amount);
        Ok(self.announce(tx))
    }

    /// Checks a raw transaction against the current ledger without applying it.
    pub fn check(&self, raw: &[u8]) -> Result<(), WalletError> {
        let sim = SimTransaction::from_raw(raw)?;
        let state = self.lock()?;
        Self::verify(&self.coin, &state, &sim).map(|_| ())
    }

    pub fn submit(&self, raw: &[u8]) -> Result<String, WalletError> {
        let sim = SimTransaction::from_raw(raw)?;
        let tx = {
            let mut state = self.lock()?;
            let inputs = Self::verify(&self.coin, &state, &sim)?;
            Self::apply(&mut state, &sim, inputs)
        };
        info!("👛️ {} transaction {} mined at height {}", self.coin, tx.txid, tx.height);
        Ok(self.announce(tx))
    }

    pub fn transaction(&self, txid: &str) -> Option<MinedTransaction> {
        let state = self.lock().ok()?;
        state.transactions.iter().find(|t| t.txid == txid).cloned()
    }

    pub fn transactions_for(&self, address: &str) -> Vec<MinedTransaction> {
        self.lock().map(|s| s.transactions.iter().filter(|t| t.touches(address)).cloned().collect()).unwrap_or_default()
    }

    pub fn transactions_since(&self, height: u64) -> Vec<MinedTransaction> {
        self.lock()
            .map(|s| s.transactions.iter().filter(|t| t.height >= height).cloned().collect())
            .unwrap_or_default()
    }

    /// Unspent outputs held by any of `addresses`.
    pub fn unspent_for(&self, addresses: &HashSet<String>) -> Vec<SpentOutput> {
        let Ok(state) = self.lock() else {
            return vec![];
        };
        let mut result = state
            .utxos
            .iter()
            .filter(|(_, u)| addresses.contains(&u.address))
            .map(|(id, u)| SpentOutput {
                outpoint_id: id.clone(),
                address: u.address.clone(),
                amount: u.amount.clone(),
            })
            .collect::<Vec<_>>();
        result.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.outpoint_id.cmp(&b.outpoint_id)));
        result
    }

    pub fn balance_of(&self, address: &str) -> Amount {
        self.lock()
            .map(|s| s.utxos.values().filter(|u| u.address == address).map(|u| &u.amount).sum())
            .unwrap_or_default()
    }

    fn announce(&self, tx: MinedTransaction) -> String {
        let txid = tx.txid.clone();
        let height = tx.height;
        let _ = self.events.send(ChainEvent::Mined(tx));
        let _ = self.events.send(ChainEvent::Block(height));
        txid
    }

    fn verify(coin: &str, state: &ChainState, sim: &SimTransaction) -> Result<Vec<SpentOutput>, WalletError> {
        let txn = &sim.unsigned;
        if txn.inputs.is_empty() {
            return Err(WalletError::Backend("transaction has no inputs".into()));
        }
        if sim.witnesses.len() != txn.inputs.len() {
            return Err(WalletError::InvalidSignature("one witness is needed per input".into()));
        }
        if txn.outputs.iter().any(|o| !o.amount.is_positive()) {
            return Err(WalletError::Backend("outputs must be positive".into()));
        }
        let mut seen = HashSet::new();
        let mut spent = Vec::with_capacity(txn.inputs.len());
        for (index, (input, witness)) in txn.inputs.iter().zip(sim.witnesses.iter()).enumerate() {
            if state.spent.contains(&input.outpoint_id) || !seen.insert(input.outpoint_id.as_str()) {
                return Err(WalletError::AlreadySpent);
            }
            let utxo = state
                .utxos
                .get(&input.outpoint_id)
                .ok_or_else(|| WalletError::UnknownTransaction(input.outpoint_id.clone()))?;
            if utxo.amount != input.amount {
                let msg = format!("input {} amount does not match the ledger", input.outpoint_id);
                return Err(WalletError::Backend(msg));
            }
            let digest = txn.sighash(index);
            Self::check_witness(coin, state.height, utxo, witness, digest)?;
            spent.push(SpentOutput {
                outpoint_id: input.outpoint_id.clone(),
                address: utxo.address.clone(),
                amount: utxo.amount.clone(),
            });
        }
        if txn.output_total() > txn.input_total() {
            return Err(WalletError::InsufficientFunds { needed: txn.output_total(), available: txn.input_total() });
        }
        Ok(spent)
    }

    fn check_witness(
        coin: &str,
        height: u64,
        utxo: &Utxo,
        witness: &Witness,
        digest: [u8; 32],
    ) -> Result<(), WalletError> {
        match witness {
            Witness::Key { public_key, signature } => {
                let key = PublicKey::from_str(public_key).map_err(|e| WalletError::InvalidSignature(e.to_string()))?;
                if key_address(coin, &key) != utxo.address {
                    return Err(WalletError::InvalidSignature("key does not match the output address".into()));
                }
                if !verify_digest(&key, digest, signature) {
                    return Err(WalletError::InvalidSignature("key signature does not verify".into()));
                }
                Ok(())
            },
            Witness::Script { redeem_script, signatures } => {
                let bytes = hex::decode(redeem_script).map_err(|e| WalletError::InvalidRedeemScript(e.to_string()))?;
                if script_address(coin, &bytes) != utxo.address {
                    return Err(WalletError::InvalidRedeemScript("script does not match the output address".into()));
                }
                let script = RedeemScript::from_bytes(&bytes)?;
                let signers = script
                    .public_keys()?
                    .iter()
                    .filter(|k| signatures.iter().any(|s| verify_digest(k, digest, s)))
                    .count();
                if signers >= script.threshold as usize {
                    return Ok(());
                }
                if let Some((blocks, key)) = script.timeout_key()? {
                    if signatures.iter().any(|s| verify_digest(&key, digest, s)) {
                        let opens_at = utxo.height + blocks;
                        return if height >= opens_at { Ok(()) } else { Err(WalletError::TimeLocked(opens_at)) };
                    }
                }
                Err(WalletError::InvalidSignature(format!(
                    "{signers} of the {} required escrow signatures are valid",
                    script.threshold
                )))
            },
        }
    }

    fn apply(state: &mut ChainState, sim: &SimTransaction, inputs: Vec<SpentOutput>) -> MinedTransaction {
        state.height += 1;
        let txid = sim.txid();
        for input in &inputs {
            state.utxos.remove(&input.outpoint_id);
            state.spent.insert(input.outpoint_id.clone());
        }
        for (i, output) in sim.unsigned.outputs.iter().enumerate() {
            state.utxos.insert(format!("{txid}:{i}"), Utxo {
                address: output.address.clone(),
                amount: output.amount.clone(),
                height: state.height,
            });
        }
        let mined = MinedTransaction { txid, inputs, outputs: sim.unsigned.outputs.clone(), height: state.height };
        state.transactions.push(mined.clone());
        mined
    }
}

#[cfg(test)]
mod test {
    use secp256k1::SecretKey;

    use super::*;
    use crate::{
        helpers::{sign_digest, SECP},
        traits::TxInput,
    };

    fn keypair() -> (SecretKey, PublicKey) {
        let sk = SecretKey::new(&mut rand::thread_rng());
        (sk, PublicKey::from_secret_key(&SECP, &sk))
    }

    fn spend_all(outpoint: &str, amount: u64, to: &str) -> UnsignedTransaction {
        UnsignedTransaction {
            inputs: vec![TxInput { outpoint_id: outpoint.into(), amount: Amount::from(amount) }],
            outputs: vec![TxOutput { address: to.into(), amount: Amount::from(amount - 200) }],
            lock_height: 0,
        }
    }

    #[test]
    fn redeem_scripts_ignore_key_order() {
        let (_, a) = keypair();
        let (_, b) = keypair();
        let (_, c) = keypair();
        let s1 = RedeemScript::new(&[a, b, c], 2, None).unwrap().to_bytes().unwrap();
        let s2 = RedeemScript::new(&[c, a, b], 2, None).unwrap().to_bytes().unwrap();
        assert_eq!(script_address("TBTC", &s1), script_address("TBTC", &s2));
        assert!(RedeemScript::new(&[a, b], 3, None).is_err());
        assert!(RedeemScript::new(&[a, b], 0, None).is_err());
    }

    #[test]
    fn two_of_three_needs_two_signatures() {
        let chain = SimulatedChain::new("TBTC");
        let keys = [keypair(), keypair(), keypair()];
        let script = RedeemScript::new(&keys.iter().map(|k| k.1).collect::<Vec<_>>(), 2, None).unwrap();
        let script = script.to_bytes().unwrap();
        let escrow = script_address("TBTC", &script);
        let funding = chain.fund(&escrow, Amount::from(10_000u64)).unwrap();
        let txn = spend_all(&format!("{funding}:0"), 10_000, "vendor");
        let sign = |sk: &SecretKey| EscrowSignature { input_index: 0, signature: sign_digest(sk, txn.sighash(0)) };

        let one = SimTransaction::script_witness(txn.clone(), &[sign(&keys[0].0)], &script);
        assert!(matches!(chain.submit(&one.to_raw().unwrap()), Err(WalletError::InvalidSignature(_))));

        let two = SimTransaction::script_witness(txn.clone(), &[sign(&keys[0].0), sign(&keys[2].0)], &script);
        let raw = two.to_raw().unwrap();
        assert!(chain.check(&raw).is_ok());
        let txid = chain.submit(&raw).unwrap();
        assert_eq!(chain.balance_of("vendor"), Amount::from(9_800u64));
        assert_eq!(chain.transaction(&txid).unwrap().inputs[0].address, escrow);
        assert!(matches!(chain.submit(&raw), Err(WalletError::AlreadySpent)));
    }

    #[test]
    fn timeout_path_opens_after_enough_blocks() {
        let chain = SimulatedChain::new("TBTC");
        let (buyer, vendor, moderator) = (keypair(), keypair(), keypair());
        let script = RedeemScript::new(&[buyer.1, vendor.1, moderator.1], 2, Some((6, &vendor.1))).unwrap();
        let script = script.to_bytes().unwrap();
        let escrow = script_address("TBTC", &script);
        let funding = chain.fund(&escrow, Amount::from(5_000u64)).unwrap();
        let txn = spend_all(&format!("{funding}:0"), 5_000, "vendor");
        let sig = EscrowSignature { input_index: 0, signature: sign_digest(&vendor.0, txn.sighash(0)) };
        let raw = SimTransaction::script_witness(txn, &[sig], &script).to_raw().unwrap();
        assert!(matches!(chain.check(&raw), Err(WalletError::TimeLocked(7))));
        chain.mine_blocks(6).unwrap();
        assert!(chain.submit(&raw).is_ok());
    }

    #[test]
    fn key_spends_need_the_right_key() {
        let chain = SimulatedChain::new("TBTC");
        let (sk, pk) = keypair();
        let (other, _) = keypair();
        let address = key_address("TBTC", &pk);
        let funding = chain.fund(&address, Amount::from(1_000u64)).unwrap();
        let txn = spend_all(&format!("{funding}:0"), 1_000, "elsewhere");
        let witness =
            |k: &SecretKey| Witness::Key { public_key: pk.to_string(), signature: sign_digest(k, txn.sighash(0)) };
        let bad = SimTransaction { unsigned: txn.clone(), witnesses: vec![witness(&other)], nonce: 0 };
        assert!(chain.submit(&bad.to_raw().unwrap()).is_err());
        let good = SimTransaction { unsigned: txn.clone(), witnesses: vec![witness(&sk)], nonce: 0 };
        assert!(chain.submit(&good.to_raw().unwrap()).is_ok());
        assert!(chain.balance_of(&address).is_zero());
    }
}
