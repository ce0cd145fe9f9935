use std::str::FromStr;

use secp256k1::{PublicKey, SecretKey};

use crate::{
    db_types::PaymentMethod,
    escrow::EscrowError,
    helpers::{derive_child_public, derive_child_secret, ChainCode, IdentityKeys, NodeIdentity},
    order_messages::OrderOpen,
    traits::{MultisigAddress, Wallet},
};

/// The simulated and bitcoin-like chains all produce a block roughly every ten minutes.
pub const BLOCKS_PER_HOUR: u64 = 6;

const ESCROW_KEY_INDEX: u32 = 0;

/// This node's escrow key for one order: a child of its escrow master key under the order's chaincode.
pub fn order_escrow_key(identity: &NodeIdentity, chaincode: &ChainCode) -> Result<SecretKey, EscrowError> {
    Ok(derive_child_secret(identity.escrow_secret(), chaincode, ESCROW_KEY_INDEX)?)
}

fn child_of(master: &PublicKey, chaincode: &ChainCode) -> Result<PublicKey, EscrowError> {
    Ok(derive_child_public(master, chaincode, ESCROW_KEY_INDEX)?)
}

/// Per-order public escrow keys of every party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowKeys {
    pub buyer: PublicKey,
    pub vendor: PublicKey,
    pub moderator: Option<PublicKey>,
}

impl EscrowKeys {
    pub fn derive(
        chaincode: &ChainCode,
        buyer: &IdentityKeys,
        vendor: &IdentityKeys,
        moderator_master: Option<&str>,
    ) -> Result<Self, EscrowError> {
        let moderator = moderator_master
            .map(|k| PublicKey::from_str(k).map_err(|e| EscrowError::InvalidKey(format!("moderator key: {e}"))))
            .transpose()?;
        Ok(Self {
            buyer: child_of(&buyer.escrow_public_key()?, chaincode)?,
            vendor: child_of(&vendor.escrow_public_key()?, chaincode)?,
            moderator: moderator.map(|m| child_of(&m, chaincode)).transpose()?,
        })
    }

    pub fn for_order(open: &OrderOpen) -> Result<Self, EscrowError> {
        let vendor = open.vendor_keys().ok_or(EscrowError::MissingVendor)?;
        Self::derive(&open.payment.chaincode, &open.buyer_id.pubkeys, vendor, open.payment.moderator_key.as_deref())
    }
}

/// Builds the payment address for a payment method.
///
/// * `DIRECT`: 1-of-1 on the vendor's order key, so only the vendor can move the money.
/// * `CANCELABLE`: 1-of-2 between buyer and vendor.
/// * `MODERATED`: 2-of-3 between buyer, vendor and moderator. A non-zero `timeout_hours` lets the vendor's key spend
///   alone once the escrowed output is that old.
pub async fn escrow_address(
    wallet: &dyn Wallet,
    method: PaymentMethod,
    keys: &EscrowKeys,
    timeout_hours: u32,
) -> Result<MultisigAddress, EscrowError> {
    match method {
        PaymentMethod::Direct => Ok(wallet.create_multisig_address(&[keys.vendor], 1).await?),
        PaymentMethod::Cancelable => Ok(wallet.create_multisig_address(&[keys.buyer, keys.vendor], 1).await?),
        PaymentMethod::Moderated => {
            let moderator = keys.moderator.ok_or(EscrowError::MissingModerator)?;
            let all = [keys.buyer, keys.vendor, moderator];
            if timeout_hours == 0 {
                Ok(wallet.create_multisig_address(&all, 2).await?)
            } else {
                let blocks = u64::from(timeout_hours) * BLOCKS_PER_HOUR;
                Ok(wallet.create_multisig_with_timeout(&all, 2, blocks, &keys.vendor).await?)
            }
        },
    }
}

/// Recomputes the escrow address of an order and checks it against what the buyer put in `ORDER_OPEN`.
pub async fn verify_escrow_address(wallet: &dyn Wallet, open: &OrderOpen) -> Result<MultisigAddress, EscrowError> {
    let keys = EscrowKeys::for_order(open)?;
    let expected = escrow_address(wallet, open.payment.method, &keys, open.payment.escrow_timeout_hours).await?;
    if expected.address != open.payment.address {
        return Err(EscrowError::AddressMismatch { expected: expected.address, got: open.payment.address.clone() });
    }
    if hex::encode(&expected.redeem_script) != open.payment.redeem_script {
        return Err(EscrowError::InvalidRedeemScript("redeem script does not match the escrow keys".into()));
    }
    Ok(expected)
}

pub fn redeem_script_of(open: &OrderOpen) -> Result<Vec<u8>, EscrowError> {
    hex::decode(&open.payment.redeem_script).map_err(|e| EscrowError::InvalidRedeemScript(e.to_string()))
}
