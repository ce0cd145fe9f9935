//! Non-hardened hierarchical key derivation over secp256k1.
//!
//! A child key at `index` is derived from a parent key and a 32-byte chaincode as
//!
//! ```text
//!    I      = HMAC-SHA512(chaincode, compressed(parent_public) || index_be32)
//!    child  = parent_secret + I[..32]          (secret side)
//!    Child  = Parent + I[..32]·G               (public side)
//! ```
//!
//! Both sides land on the same keypair, so a buyer can hand out public child keys that a vendor can recompute and
//! only the buyer can sign for. Rating keys and per-order escrow keys are both derived this way.
use std::{fmt::Display, str::FromStr};

use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand::RngCore;
use secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha512;
use thiserror::Error;

pub static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyDerivationError {
    #[error("Invalid chaincode: {0}")]
    InvalidChaincode(String),
    #[error("Index {0} produced an invalid child key")]
    InvalidChild(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainCode([u8; 32]);

impl ChainCode {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for ChainCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ChainCode {
    type Err = KeyDerivationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| KeyDerivationError::InvalidChaincode(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| KeyDerivationError::InvalidChaincode(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ChainCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChainCode::from_str(&s).map_err(de::Error::custom)
    }
}

fn tweak_for(parent: &PublicKey, chaincode: &ChainCode, index: u32) -> Result<Scalar, KeyDerivationError> {
    // A 32-byte HMAC key is always accepted
    let mut mac = HmacSha512::new_from_slice(chaincode.as_bytes())
        .map_err(|e| KeyDerivationError::InvalidChaincode(e.to_string()))?;
    mac.update(&parent.serialize());
    mac.update(&index.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let mut left = [0u8; 32];
    left.copy_from_slice(&digest[..32]);
    Scalar::from_be_bytes(left).map_err(|_| KeyDerivationError::InvalidChild(index))
}

pub fn derive_child_secret(
    parent: &SecretKey,
    chaincode: &ChainCode,
    index: u32,
) -> Result<SecretKey, KeyDerivationError> {
    let parent_public = PublicKey::from_secret_key(&SECP, parent);
    let tweak = tweak_for(&parent_public, chaincode, index)?;
    parent.add_tweak(&tweak).map_err(|_| KeyDerivationError::InvalidChild(index))
}

pub fn derive_child_public(
    parent: &PublicKey,
    chaincode: &ChainCode,
    index: u32,
) -> Result<PublicKey, KeyDerivationError> {
    let tweak = tweak_for(parent, chaincode, index)?;
    parent.add_exp_tweak(&SECP, &tweak).map_err(|_| KeyDerivationError::InvalidChild(index))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secret_and_public_derivation_agree() {
        let parent = SecretKey::new(&mut rand::thread_rng());
        let parent_pub = PublicKey::from_secret_key(&SECP, &parent);
        let chaincode = ChainCode::random();
        for i in 0..5 {
            let child = derive_child_secret(&parent, &chaincode, i).unwrap();
            let child_pub = derive_child_public(&parent_pub, &chaincode, i).unwrap();
            assert_eq!(PublicKey::from_secret_key(&SECP, &child), child_pub);
            assert_ne!(child_pub, parent_pub);
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let parent = SecretKey::from_str("0101010101010101010101010101010101010101010101010101010101010101").unwrap();
        let chaincode = ChainCode::new([7u8; 32]);
        let a = derive_child_secret(&parent, &chaincode, 3).unwrap();
        let b = derive_child_secret(&parent, &chaincode, 3).unwrap();
        let c = derive_child_secret(&parent, &chaincode, 4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let other_chain = derive_child_secret(&parent, &ChainCode::new([8u8; 32]), 3).unwrap();
        assert_ne!(a, other_chain);
    }

    #[test]
    fn chaincode_hex() {
        let chaincode = ChainCode::random();
        let json = serde_json::to_string(&chaincode).unwrap();
        assert_eq!(json.len(), 66);
        let back: ChainCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chaincode);
        assert!("abcd".parse::<ChainCode>().is_err());
        assert!("zz".parse::<ChainCode>().is_err());
    }
}
