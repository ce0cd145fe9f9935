use std::fmt::Display;

use agora_common::Amount;
use async_trait::async_trait;
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    db_types::{OrderId, WalletTransaction},
    helpers::hashing::sha256,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("The amount {0} is below the dust threshold")]
    DustAmount(Amount),
    #[error("Insufficient funds. Needed {needed}, but only {available} is available")]
    InsufficientFunds { needed: Amount, available: Amount },
    #[error("One or more inputs have already been spent")]
    AlreadySpent,
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid redeem script: {0}")]
    InvalidRedeemScript(String),
    #[error("Signature verification failed: {0}")]
    InvalidSignature(String),
    #[error("The time lock has not expired yet. It opens at height {0}")]
    TimeLocked(u64),
    #[error("No wallet is configured for {0}")]
    UnsupportedCoin(String),
    #[error("The wallet is not open")]
    NotOpen,
    #[error("Wallet backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FeeLevel {
    Economic,
    #[default]
    Normal,
    Priority,
}

impl Display for FeeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeeLevel::Economic => write!(f, "economic"),
            FeeLevel::Normal => write!(f, "normal"),
            FeeLevel::Priority => write!(f, "priority"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Balance {
    pub confirmed: Amount,
    pub unconfirmed: Amount,
}

/// Wallet writes accumulated during one order transition. Nothing reaches the network until the batch is passed to
/// [`Wallet::commit`].
#[derive(Debug, Clone, Default)]
pub struct WalletBatch {
    pub(crate) transactions: Vec<Vec<u8>>,
    pub(crate) watch: Vec<String>,
}

impl WalletBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.watch.is_empty()
    }

    pub fn push_transaction(&mut self, raw: Vec<u8>) {
        self.transactions.push(raw);
    }

    pub fn push_watch(&mut self, address: String) {
        if !self.watch.contains(&address) {
            self.watch.push(address);
        }
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.transactions
    }

    pub fn watched(&self) -> &[String] {
        &self.watch
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInput {
    pub outpoint_id: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: Amount,
}

/// A spend of escrow outputs that still needs signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    #[serde(default)]
    pub lock_height: u64,
}

impl UnsignedTransaction {
    pub fn input_total(&self) -> Amount {
        self.inputs.iter().map(|i| &i.amount).sum()
    }

    pub fn output_total(&self) -> Amount {
        self.outputs.iter().map(|o| &o.amount).sum()
    }

    pub fn fee(&self) -> Amount {
        self.input_total() - self.output_total()
    }

    /// The digest each input's signature commits to: every input and output, the lock height and the input's own
    /// position.
    pub fn sighash(&self, input_index: usize) -> [u8; 32] {
        let mut preimage = Vec::new();
        for input in &self.inputs {
            preimage.extend_from_slice(input.outpoint_id.as_bytes());
            preimage.push(b'|');
            preimage.extend_from_slice(input.amount.to_string().as_bytes());
            preimage.push(b';');
        }
        for output in &self.outputs {
            preimage.extend_from_slice(output.address.as_bytes());
            preimage.push(b'|');
            preimage.extend_from_slice(output.amount.to_string().as_bytes());
            preimage.push(b';');
        }
        preimage.extend_from_slice(&self.lock_height.to_be_bytes());
        preimage.extend_from_slice(&(input_index as u64).to_be_bytes());
        sha256(&preimage)
    }
}

/// A DER signature (hex) over one input of an [`UnsignedTransaction`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowSignature {
    pub input_index: u32,
    pub signature: String,
}

/// A multisig address together with the script that unlocks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigAddress {
    pub address: String,
    pub redeem_script: Vec<u8>,
}

/// The contract every coin wallet fulfils. Implementations must be safe to share between the order processor and the
/// node's subscription workers.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Currency code, including the `T` prefix on testnets.
    fn coin(&self) -> &str;

    async fn open(&self) -> Result<(), WalletError>;

    async fn close(&self) -> Result<(), WalletError>;

    async fn current_address(&self) -> Result<String, WalletError>;

    /// A fresh receiving address, optionally labelled with the order it was issued for.
    async fn new_address(&self, order_id: Option<&OrderId>) -> Result<String, WalletError>;

    async fn balance(&self) -> Result<Balance, WalletError>;

    /// Builds a payment into `batch` and returns its txid. It is broadcast when the batch is committed.
    async fn spend(
        &self,
        batch: &mut WalletBatch,
        to: &str,
        amount: &Amount,
        fee_level: FeeLevel,
    ) -> Result<String, WalletError>;

    /// Moves every spendable output to `to`.
    async fn sweep_wallet(&self, batch: &mut WalletBatch, to: &str, fee_level: FeeLevel) -> Result<String, WalletError>;

    /// Broadcasts the batch's transactions and starts watching its addresses.
    async fn commit(&self, batch: WalletBatch) -> Result<Vec<String>, WalletError>;

    /// The same key set and threshold always yield the same address, whatever order the keys are given in.
    async fn create_multisig_address(
        &self,
        keys: &[PublicKey],
        threshold: u32,
    ) -> Result<MultisigAddress, WalletError>;

    /// As [`Wallet::create_multisig_address`], with an escape path: after `timeout_blocks` confirmations the single
    /// `timeout_key` may spend alone.
    async fn create_multisig_with_timeout(
        &self,
        keys: &[PublicKey],
        threshold: u32,
        timeout_blocks: u64,
        timeout_key: &PublicKey,
    ) -> Result<MultisigAddress, WalletError>;

    async fn sign_multisig_transaction(
        &self,
        txn: &UnsignedTransaction,
        key: &SecretKey,
        redeem_script: &[u8],
    ) -> Result<Vec<EscrowSignature>, WalletError>;

    /// Assembles a multisig spend from the collected signatures into `batch`, returning its txid.
    async fn build_and_send(
        &self,
        batch: &mut WalletBatch,
        txn: &UnsignedTransaction,
        signatures: &[EscrowSignature],
        redeem_script: &[u8],
    ) -> Result<String, WalletError>;

    async fn watch_address(&self, batch: &mut WalletBatch, address: &str) -> Result<(), WalletError>;

    async fn get_transaction(&self, txid: &str) -> Result<Option<WalletTransaction>, WalletError>;

    async fn transactions_for_address(&self, address: &str) -> Result<Vec<WalletTransaction>, WalletError>;

    /// Transactions touching the wallet's own or watched addresses.
    fn subscribe_transactions(&self) -> broadcast::Receiver<WalletTransaction>;

    /// New block heights.
    fn subscribe_blocks(&self) -> broadcast::Receiver<u64>;

    async fn estimate_spend_fee(&self, amount: &Amount, fee_level: FeeLevel) -> Result<Amount, WalletError>;

    async fn estimate_escrow_fee(&self, threshold: u32, fee_level: FeeLevel) -> Result<Amount, WalletError>;

    fn is_dust(&self, amount: &Amount) -> bool;

    async fn chain_height(&self) -> Result<u64, WalletError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sighash_commits_to_position_and_outputs() {
        let mut txn = UnsignedTransaction {
            inputs: vec![
                TxInput { outpoint_id: "a:0".into(), amount: Amount::from(500u64) },
                TxInput { outpoint_id: "b:1".into(), amount: Amount::from(700u64) },
            ],
            outputs: vec![TxOutput { address: "vendor".into(), amount: Amount::from(1100u64) }],
            lock_height: 0,
        };
        assert_eq!(txn.fee(), Amount::from(100u64));
        let first = txn.sighash(0);
        assert_ne!(first, txn.sighash(1));
        txn.outputs[0].amount = Amount::from(1000u64);
        assert_ne!(first, txn.sighash(0));
    }

    #[test]
    fn batch_watch_list_has_no_duplicates() {
        let mut batch = WalletBatch::new();
        assert!(batch.is_empty());
        batch.push_watch("addr".into());
        batch.push_watch("addr".into());
        assert_eq!(batch.watched().len(), 1);
    }
}
