//! # Escrow coordinator
//!
//! Every order is paid into a script address derived from the parties' per-order keys. Getting money back out needs
//! either one signature (the vendor of a direct order, either party of a 1-of-2 cancelable escrow, or the vendor after
//! a moderated escrow's time lock) or two of three.
//!
//! A release is an [`UnsignedTransaction`] spending every unspent output of the escrow address, plus whatever
//! signatures the counterparty has already made. The party that finishes the release adds its own signatures and
//! hands the transaction to its wallet. Releases always satisfy `Σ outputs + fee = escrow balance`, and never contain
//! dust outputs (see [`distribute`]).
mod keys;
mod payout;

use std::{collections::HashSet, sync::Arc};

use agora_common::Amount;
pub use keys::{escrow_address, order_escrow_key, redeem_script_of, verify_escrow_address, EscrowKeys, BLOCKS_PER_HOUR};
use log::*;
pub use payout::distribute;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    db_types::OrderRecord,
    helpers::{IdentityError, KeyDerivationError, NodeIdentity},
    order_messages::OrderOpen,
    traits::{EscrowSignature, TxInput, TxOutput, UnsignedTransaction, Wallet, WalletBatch, WalletError},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscrowError {
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("Key derivation failed: {0}")]
    KeyDerivation(#[from] KeyDerivationError),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Invalid escrow key: {0}")]
    InvalidKey(String),
    #[error("A moderated payment needs a moderator key")]
    MissingModerator,
    #[error("The order has no vendor")]
    MissingVendor,
    #[error("Escrow address mismatch. Expected {expected}, got {got}")]
    AddressMismatch { expected: String, got: String },
    #[error("Invalid redeem script: {0}")]
    InvalidRedeemScript(String),
    #[error("There are no unspent escrow outputs to release")]
    NothingToRelease,
    #[error("Requested payouts of {requested} exceed the escrow balance of {balance}")]
    Overdrawn { requested: Amount, balance: Amount },
    #[error("Release does not match the agreed payout: {0}")]
    PayoutMismatch(String),
}

/// A release transaction and the signatures collected for it so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub transaction: UnsignedTransaction,
    pub signatures: Vec<EscrowSignature>,
}

/// Builds a release of the whole escrow balance of `order` to `payouts`. The fee is whatever the payouts leave over.
pub fn build_release(
    order: &OrderRecord,
    payouts: Vec<TxOutput>,
    wallet: &dyn Wallet,
) -> Result<UnsignedTransaction, EscrowError> {
    let inputs = order
        .unspent_outputs()
        .into_iter()
        .map(|s| TxInput { outpoint_id: s.outpoint_id, amount: s.amount })
        .collect::<Vec<_>>();
    if inputs.is_empty() {
        return Err(EscrowError::NothingToRelease);
    }
    let balance: Amount = inputs.iter().map(|i| &i.amount).sum();
    let requested: Amount = payouts.iter().map(|o| &o.amount).sum();
    if requested > balance {
        return Err(EscrowError::Overdrawn { requested, balance });
    }
    let (outputs, extra_fee) = distribute(payouts, |a| wallet.is_dust(a));
    if !extra_fee.is_zero() {
        warn!("🔐️ Every payout of order {} is dust. {extra_fee} goes to fees", order.order_id);
    }
    Ok(UnsignedTransaction { inputs, outputs, lock_height: 0 })
}

/// A release paying everything but `fee` to a single address.
pub fn build_release_to(
    order: &OrderRecord,
    address: &str,
    fee: &Amount,
    wallet: &dyn Wallet,
) -> Result<UnsignedTransaction, EscrowError> {
    let balance = order.escrow_balance();
    if balance <= *fee {
        return Err(EscrowError::Overdrawn { requested: fee.clone(), balance });
    }
    build_release(order, vec![TxOutput { address: address.to_string(), amount: balance - fee.clone() }], wallet)
}

/// Checks that a counterparty's release spends exactly the escrow outputs we know about, and pays `expected`.
pub fn check_release(order: &OrderRecord, release: &ReleaseInfo, expected: &[TxOutput]) -> Result<(), EscrowError> {
    let known = order.unspent_outputs().into_iter().map(|s| (s.outpoint_id, s.amount)).collect::<HashSet<_>>();
    let spent = release
        .transaction
        .inputs
        .iter()
        .map(|i| (i.outpoint_id.clone(), i.amount.clone()))
        .collect::<HashSet<_>>();
    if known != spent {
        return Err(EscrowError::PayoutMismatch("release does not spend the escrow outputs".into()));
    }
    let mut got = release.transaction.outputs.clone();
    let mut want = expected.to_vec();
    got.sort_by(|a, b| a.address.cmp(&b.address));
    want.sort_by(|a, b| a.address.cmp(&b.address));
    if got != want {
        return Err(EscrowError::PayoutMismatch(format!("outputs {got:?} differ from {want:?}")));
    }
    if release.transaction.fee().is_negative() {
        return Err(EscrowError::PayoutMismatch("release has a negative fee".into()));
    }
    Ok(())
}

/// Signs and finishes escrow releases for one node and one coin wallet.
#[derive(Clone)]
pub struct EscrowCoordinator {
    wallet: Arc<dyn Wallet>,
    identity: NodeIdentity,
}

impl EscrowCoordinator {
    pub fn new(wallet: Arc<dyn Wallet>, identity: NodeIdentity) -> Self {
        Self { wallet, identity }
    }

    pub fn wallet(&self) -> &dyn Wallet {
        self.wallet.as_ref()
    }

    /// Adds this node's signatures to a release.
    pub async fn sign(&self, open: &OrderOpen, transaction: UnsignedTransaction) -> Result<ReleaseInfo, EscrowError> {
        let key = order_escrow_key(&self.identity, &open.payment.chaincode)?;
        let script = redeem_script_of(open)?;
        let signatures = self.wallet.sign_multisig_transaction(&transaction, &key, &script).await?;
        Ok(ReleaseInfo { transaction, signatures })
    }

    /// Adds this node's signatures to `release` and stages the finished transaction in `batch`.
    pub async fn finish(
        &self,
        batch: &mut WalletBatch,
        open: &OrderOpen,
        release: &ReleaseInfo,
    ) -> Result<String, EscrowError> {
        let own = self.sign(open, release.transaction.clone()).await?;
        let mut signatures = release.signatures.clone();
        signatures.extend(own.signatures);
        let script = redeem_script_of(open)?;
        let txid = self.wallet.build_and_send(batch, &release.transaction, &signatures, &script).await?;
        info!(
            "🔐️ Releasing escrow {} in {txid}: {} to {} outputs, fee {}",
            open.payment.address,
            release.transaction.output_total(),
            release.transaction.outputs.len(),
            release.transaction.fee()
        );
        Ok(txid)
    }

    /// Spends an escrow on this node's signature alone: a cancelable escrow, or a moderated one past its time lock.
    pub async fn release_alone(
        &self,
        batch: &mut WalletBatch,
        open: &OrderOpen,
        transaction: UnsignedTransaction,
    ) -> Result<String, EscrowError> {
        let release = ReleaseInfo { transaction, signatures: vec![] };
        self.finish(batch, open, &release).await
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::*;
    use crate::{
        db_types::{OrderId, OrderState, OrderTransaction, PaymentMethod, Role, SpendInfo, WalletTransaction},
        helpers::ChainCode,
        wallet::{SimulatedChain, SimulatedWallet},
    };

    fn escrow_order(address: &str, txid: &str, amount: u64) -> OrderRecord {
        let now = Utc::now();
        let funding = WalletTransaction {
            id: txid.into(),
            from: vec![],
            to: vec![SpendInfo {
                outpoint_id: format!("{txid}:0"),
                address: address.into(),
                amount: Amount::from(amount),
                is_relevant: false,
                is_watched: true,
            }],
            height: 1,
        };
        OrderRecord {
            order_id: OrderId::new("order"),
            role: Role::Buyer,
            state: OrderState::Funded,
            payment_method: PaymentMethod::Moderated,
            payment_coin: "TBTC".into(),
            payment_address: address.into(),
            payment_amount: Amount::from(amount),
            funded: true,
            funding_notified: true,
            messages: vec![],
            transactions: vec![OrderTransaction {
                txid: txid.into(),
                height: 1,
                transaction: funding,
                recorded_at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn two_of_three_release() {
        let chain = SimulatedChain::new("TBTC");
        let wallet = SimulatedWallet::random(chain.clone());
        wallet.open().await.unwrap();
        let (buyer, vendor, moderator) = (NodeIdentity::random(), NodeIdentity::random(), NodeIdentity::random());
        let chaincode = ChainCode::random();
        let keys = EscrowKeys::derive(
            &chaincode,
            &buyer.keys(),
            &vendor.keys(),
            Some(&moderator.escrow_public().to_string()),
        )
        .unwrap();
        let escrow = escrow_address(&wallet, PaymentMethod::Moderated, &keys, 0).await.unwrap();
        let again = escrow_address(&wallet, PaymentMethod::Moderated, &keys, 0).await.unwrap();
        assert_eq!(escrow, again);
        let txid = chain.fund(&escrow.address, Amount::from(1_000_000u64)).unwrap();
        let order = escrow_order(&escrow.address, &txid, 1_000_000);

        let payouts = vec![
            TxOutput { address: "buyer".into(), amount: Amount::from(800_000u64) },
            TxOutput { address: "vendor".into(), amount: Amount::from(150_000u64) },
        ];
        let txn = build_release(&order, payouts.clone(), &wallet).unwrap();
        assert_eq!(txn.fee(), Amount::from(50_000u64));

        let key = order_escrow_key(&moderator, &chaincode).unwrap();
        let sigs = wallet.sign_multisig_transaction(&txn, &key, &escrow.redeem_script).await.unwrap();
        let release = ReleaseInfo { transaction: txn, signatures: sigs };
        check_release(&order, &release, &payouts).unwrap();

        let buyer_key = order_escrow_key(&buyer, &chaincode).unwrap();
        let mut signatures = release.signatures.clone();
        signatures.extend(
            wallet.sign_multisig_transaction(&release.transaction, &buyer_key, &escrow.redeem_script).await.unwrap(),
        );
        let mut batch = WalletBatch::new();
        let spend = wallet.build_and_send(&mut batch, &release.transaction, &signatures, &escrow.redeem_script).await;
        assert!(spend.is_ok());
        wallet.commit(batch).await.unwrap();
        assert_eq!(chain.balance_of(&escrow.address), Amount::zero());
        assert_eq!(chain.balance_of("buyer"), Amount::from(800_000u64));
    }

    #[tokio::test]
    async fn releases_cannot_overdraw() {
        let chain = SimulatedChain::new("TBTC");
        let wallet = SimulatedWallet::random(chain);
        let order = escrow_order("escrow", "t1", 1000);
        let payouts = vec![TxOutput { address: "buyer".into(), amount: Amount::from(1001u64) }];
        assert!(matches!(build_release(&order, payouts, &wallet), Err(EscrowError::Overdrawn { .. })));
        let err = build_release_to(&order, "buyer", &Amount::from(1000u64), &wallet).unwrap_err();
        assert!(matches!(err, EscrowError::Overdrawn { .. }));
        let mut empty = order.clone();
        empty.transactions.clear();
        assert_eq!(build_release(&empty, vec![], &wallet), Err(EscrowError::NothingToRelease));
    }
}
