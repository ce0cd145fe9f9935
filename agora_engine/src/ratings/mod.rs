//! # Ratings
//!
//! A buyer derives one secp256k1 *rating key* per order item from its rating master key and the order's chaincode,
//! and lists the public halves in `ORDER_OPEN`. Once paid, the vendor signs `(slug, rating key)` for every item with
//! its identity key. When the order completes, the buyer rates each item with a [`Rating`] signed by the rating key.
//!
//! Anyone holding the `ORDER_OPEN` can then check that a rating came from a real buyer of that listing, without the
//! rating revealing which order it belongs to.
mod index;

use std::str::FromStr;

use chrono::{DateTime, Utc};
pub use index::{RatingIndex, RatingIndexEntry, RATING_INDEX_PATH};
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    db::StoreError,
    db_types::PeerId,
    helpers::{
        derive_child_secret,
        hashing::sha256,
        sign_digest,
        verify_digest,
        ChainCode,
        IdentityError,
        IdentitySignature,
        KeyDerivationError,
        NodeIdentity,
        SECP,
    },
    order_messages::OrderOpen,
};

#[derive(Debug, Error)]
pub enum RatingError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Key derivation failed: {0}")]
    KeyDerivation(#[from] KeyDerivationError),
    #[error("Expected {expected} rating keys, got {got}")]
    WrongKeyCount { expected: usize, got: usize },
    #[error("Rating signature {index} is for listing {got}, expected {expected}")]
    SlugMismatch { index: usize, expected: String, got: String },
    #[error("Rating key {0} is not part of the order")]
    UnknownRatingKey(String),
    #[error("Order item {0} refers to a listing that is not in the order")]
    UnknownListing(usize),
    #[error("Invalid rating signature: {0}")]
    InvalidSignature(String),
    #[error("Score {0} is outside 1..=5")]
    InvalidScore(u8),
    #[error("Could not serialize rating: {0}")]
    Serialization(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for RatingError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// The vendor's identity signature over one item's rating key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingSignature {
    pub slug: String,
    pub rating_key: String,
    pub signature: IdentitySignature,
}

fn rating_key_message(slug: &str, rating_key: &str) -> Vec<u8> {
    format!("{slug}:{rating_key}").into_bytes()
}

impl RatingSignature {
    pub fn verify(&self, vendor: &PeerId) -> Result<(), RatingError> {
        self.signature.verify(vendor, &rating_key_message(&self.slug, &self.rating_key))?;
        Ok(())
    }
}

pub fn derive_rating_keys(master: &SecretKey, chaincode: &ChainCode, n: usize) -> Result<Vec<SecretKey>, RatingError> {
    (0..n as u32).map(|i| derive_child_secret(master, chaincode, i).map_err(RatingError::from)).collect()
}

/// Hex compressed public rating keys, as listed in `ORDER_OPEN`.
pub fn rating_public_keys(master: &SecretKey, chaincode: &ChainCode, n: usize) -> Result<Vec<String>, RatingError> {
    Ok(derive_rating_keys(master, chaincode, n)?
        .iter()
        .map(|k| PublicKey::from_secret_key(&SECP, k).to_string())
        .collect())
}

fn item_slugs(open: &OrderOpen) -> Result<Vec<String>, RatingError> {
    open.items
        .iter()
        .enumerate()
        .map(|(i, item)| open.listing_for(item).map(|l| l.listing.slug.clone()).ok_or(RatingError::UnknownListing(i)))
        .collect()
}

/// Vendor side: one signature per order item.
pub fn sign_rating_keys(vendor: &NodeIdentity, open: &OrderOpen) -> Result<Vec<RatingSignature>, RatingError> {
    let slugs = item_slugs(open)?;
    if open.rating_keys.len() != slugs.len() {
        return Err(RatingError::WrongKeyCount { expected: slugs.len(), got: open.rating_keys.len() });
    }
    slugs
        .into_iter()
        .zip(open.rating_keys.iter())
        .map(|(slug, key)| {
            let signature = vendor.sign(&rating_key_message(&slug, key))?;
            Ok(RatingSignature { slug, rating_key: key.clone(), signature })
        })
        .collect()
}

/// Buyer side. Every signature must be for the right listing and key, and signed by the vendor. One bad signature
/// rejects the whole set.
pub fn verify_rating_signatures(open: &OrderOpen, signatures: &[RatingSignature]) -> Result<(), RatingError> {
    let slugs = item_slugs(open)?;
    if signatures.len() != slugs.len() {
        return Err(RatingError::WrongKeyCount { expected: slugs.len(), got: signatures.len() });
    }
    let vendor = open.vendor().ok_or(RatingError::UnknownListing(0))?;
    for (index, ((sig, slug), key)) in signatures.iter().zip(slugs.iter()).zip(open.rating_keys.iter()).enumerate() {
        if &sig.slug != slug {
            return Err(RatingError::SlugMismatch { index, expected: slug.clone(), got: sig.slug.clone() });
        }
        if &sig.rating_key != key {
            return Err(RatingError::UnknownRatingKey(sig.rating_key.clone()));
        }
        sig.verify(vendor)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingScores {
    pub overall: u8,
    pub quality: u8,
    pub description: u8,
    pub delivery_speed: u8,
    pub customer_service: u8,
}

impl RatingScores {
    pub fn validate(&self) -> Result<(), RatingError> {
        [self.overall, self.quality, self.description, self.delivery_speed, self.customer_service]
            .into_iter()
            .find(|s| !(1..=5).contains(s))
            .map_or(Ok(()), |s| Err(RatingError::InvalidScore(s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingData {
    pub slug: String,
    pub rating_key: String,
    pub vendor_id: PeerId,
    pub vendor_sig: RatingSignature,
    /// Absent for anonymous ratings.
    pub buyer_id: Option<PeerId>,
    pub buyer_name: Option<String>,
    /// The buyer's identity signature over `sha256(rating_key)`.
    pub buyer_sig: IdentitySignature,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub scores: RatingScores,
    pub review: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub rating_data: RatingData,
    /// Hex DER signature by the rating key over `sha256(serialized rating_data)`.
    pub signature: String,
}

impl Rating {
    /// Builds and signs a rating for order item `index`.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        buyer: &NodeIdentity,
        open: &OrderOpen,
        index: usize,
        vendor_sig: RatingSignature,
        scores: RatingScores,
        review: &str,
        anonymous: bool,
    ) -> Result<Self, RatingError> {
        scores.validate()?;
        let key = derive_child_secret(buyer.rating_master(), &open.payment.chaincode, index as u32)?;
        let rating_key = PublicKey::from_secret_key(&SECP, &key).to_string();
        let data = RatingData {
            slug: vendor_sig.slug.clone(),
            rating_key: rating_key.clone(),
            vendor_id: open.vendor().cloned().ok_or(RatingError::UnknownListing(index))?,
            vendor_sig,
            buyer_id: (!anonymous).then(|| buyer.peer_id().clone()),
            buyer_name: (!anonymous).then(|| open.buyer_id.handle.clone()),
            buyer_sig: buyer.sign(&sha256(rating_key.as_bytes()))?,
            timestamp: Utc::now(),
            scores,
            review: review.to_string(),
        };
        let digest = sha256(&serde_json::to_vec(&data)?);
        Ok(Self { rating_data: data, signature: sign_digest(&key, digest) })
    }

    /// A content hash, used to name the rating's public file.
    pub fn hash(&self) -> Result<String, RatingError> {
        Ok(crate::helpers::hashing::blake2b_hex(&serde_json::to_vec(self)?))
    }
}

/// Checks a rating against the order it claims to come from: the key is one of the order's rating keys, the vendor
/// signed it for this listing, the order's buyer signed it, and the rating key signed the rating itself.
pub fn verify_rating(open: &OrderOpen, rating: &Rating) -> Result<(), RatingError> {
    let data = &rating.rating_data;
    data.scores.validate()?;
    if !open.rating_keys.contains(&data.rating_key) {
        return Err(RatingError::UnknownRatingKey(data.rating_key.clone()));
    }
    let vendor = open.vendor().ok_or(RatingError::UnknownListing(0))?;
    if &data.vendor_id != vendor {
        return Err(RatingError::InvalidSignature(format!("rating names vendor {}", data.vendor_id)));
    }
    if data.vendor_sig.slug != data.slug || data.vendor_sig.rating_key != data.rating_key {
        return Err(RatingError::InvalidSignature("vendor signature covers a different listing or key".into()));
    }
    data.vendor_sig.verify(vendor)?;
    if let Some(buyer) = &data.buyer_id {
        if buyer != open.buyer() {
            return Err(RatingError::InvalidSignature(format!("rating names buyer {buyer}")));
        }
    }
    data.buyer_sig.verify(open.buyer(), &sha256(data.rating_key.as_bytes()))?;
    let key = PublicKey::from_str(&data.rating_key).map_err(|e| RatingError::InvalidSignature(e.to_string()))?;
    let digest = sha256(&serde_json::to_vec(data)?);
    if !verify_digest(&key, digest, &rating.signature) {
        return Err(RatingError::InvalidSignature("rating key signature does not verify".into()));
    }
    Ok(())
}
