//! # Node identity and message signatures
//!
//! Every node has a Ristretto identity key. Its hex-encoded public key doubles as the node's [`PeerId`], so anyone
//! holding a peer id can verify that peer's signatures without a separate key lookup.
//!
//! Order messages are signed with a domain-separated Schnorr signature over
//!
//! ```text
//!    {order_id}{message_type}{serialized payload}
//! ```
//!
//! Signatures travel as 128 hex characters: the 32-byte public nonce followed by the 32-byte signature scalar.
//!
//! Alongside the identity key a node holds two secp256k1 keys: one for escrow multisig and one master key from which
//! per-order rating keys are derived.
use std::{fmt::Debug, str::FromStr};

use agora_common::Secret;
use rand::thread_rng;
use secp256k1::{PublicKey as EcPublicKey, SecretKey as EcSecretKey};
use serde::{Deserialize, Serialize};
use tari_crypto::{
    hash_domain,
    hashing::DomainSeparation,
    keys::PublicKey,
    ristretto::{RistrettoPublicKey, RistrettoSchnorrWithDomain, RistrettoSecretKey},
    tari_utilities::hex::Hex,
};
use thiserror::Error;

use crate::{db_types::PeerId, helpers::hd_keys::SECP};

hash_domain!(AgoraSignatureDomain, "agora.order_signature");

pub type IdentitySchnorr = RistrettoSchnorrWithDomain<AgoraSignatureDomain>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Could not sign message: {0}")]
    SigningFailed(String),
}

impl From<String> for IdentityError {
    fn from(e: String) -> Self {
        Self::InvalidSignature(e)
    }
}

/// A hex-encoded identity signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentitySignature(String);

impl IdentitySignature {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn from_schnorr(sig: &IdentitySchnorr) -> Self {
        let nonce = sig.get_public_nonce().to_hex();
        let sig = sig.get_signature().to_hex();
        Self(format!("{nonce}{sig}"))
    }

    fn to_schnorr(&self) -> Result<IdentitySchnorr, IdentityError> {
        hex_to_schnorr::<_, IdentityError>(&self.0)
    }

    /// Checks this signature against the identity key behind `signer`.
    pub fn verify(&self, signer: &PeerId, message: &[u8]) -> Result<(), IdentityError> {
        let pubkey = public_key_for_peer(signer)?;
        let sig = self.to_schnorr()?;
        if sig.verify(&pubkey, message) {
            Ok(())
        } else {
            Err(IdentityError::InvalidSignature(format!("signature does not verify against {signer}")))
        }
    }
}

/// Peer ids and signatures arrive from other nodes, so they are checked before any slicing.
fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn hex_to_schnorr<H: DomainSeparation, E: From<String>>(s: &str) -> Result<RistrettoSchnorrWithDomain<H>, E> {
    if !is_hex(s) {
        return Err(E::from("Signature is not a hex string".into()));
    }
    if s.len() != 128 {
        return Err(E::from("Invalid signature length".into()));
    }
    let nonce = RistrettoPublicKey::from_hex(&s[..64])
        .map_err(|e| E::from(format!("Signature contains an invalid public nonce. {e}")))?;
    let sig = RistrettoSecretKey::from_hex(&s[64..])
        .map_err(|e| E::from(format!("Signature contains an invalid signature key. {e}")))?;
    Ok(RistrettoSchnorrWithDomain::new(nonce, sig))
}

pub fn public_key_for_peer(peer: &PeerId) -> Result<RistrettoPublicKey, IdentityError> {
    if !is_hex(peer.as_str()) {
        return Err(IdentityError::InvalidKey(format!("peer id {peer} is not a hex string")));
    }
    RistrettoPublicKey::from_hex(peer.as_str())
        .map_err(|e| IdentityError::InvalidKey(format!("peer id {peer} is not an identity key. {e}")))
}

/// Public keys a node publishes about itself, as embedded in orders and listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    /// Hex Ristretto public key (equal to the peer id).
    pub identity: String,
    /// Hex compressed secp256k1 public key used for escrow.
    pub secp256k1: String,
}

impl IdentityKeys {
    pub fn escrow_public_key(&self) -> Result<EcPublicKey, IdentityError> {
        EcPublicKey::from_str(&self.secp256k1).map_err(|e| IdentityError::InvalidKey(format!("escrow key: {e}")))
    }
}

#[derive(Clone)]
pub struct NodeIdentity {
    secret: RistrettoSecretKey,
    public: RistrettoPublicKey,
    peer_id: PeerId,
    escrow_key: EcSecretKey,
    rating_master: EcSecretKey,
}

impl Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeIdentity({})", self.peer_id)
    }
}

impl NodeIdentity {
    pub fn random() -> Self {
        let mut rng = thread_rng();
        let (secret, public) = RistrettoPublicKey::random_keypair(&mut rng);
        let peer_id = PeerId::new(public.to_hex());
        let escrow_key = EcSecretKey::new(&mut rng);
        let rating_master = EcSecretKey::new(&mut rng);
        Self { secret, public, peer_id, escrow_key, rating_master }
    }

    /// Restores an identity from hex-encoded secret keys.
    pub fn from_hex_keys(identity: &str, escrow: &str, rating: &str) -> Result<Self, IdentityError> {
        let secret = RistrettoSecretKey::from_hex(identity)
            .map_err(|e| IdentityError::InvalidKey(format!("identity key: {e}")))?;
        let public = RistrettoPublicKey::from_secret_key(&secret);
        let peer_id = PeerId::new(public.to_hex());
        let escrow_key =
            EcSecretKey::from_str(escrow).map_err(|e| IdentityError::InvalidKey(format!("escrow key: {e}")))?;
        let rating_master =
            EcSecretKey::from_str(rating).map_err(|e| IdentityError::InvalidKey(format!("rating key: {e}")))?;
        Ok(Self { secret, public, peer_id, escrow_key, rating_master })
    }

    /// The hex secret keys [`NodeIdentity::from_hex_keys`] restores from, in the order identity, escrow, rating.
    pub fn to_hex_keys(&self) -> [Secret<String>; 3] {
        [
            Secret::new(self.secret.to_hex()),
            Secret::new(hex::encode(self.escrow_key.secret_bytes())),
            Secret::new(hex::encode(self.rating_master.secret_bytes())),
        ]
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn public_key(&self) -> &RistrettoPublicKey {
        &self.public
    }

    pub fn escrow_secret(&self) -> &EcSecretKey {
        &self.escrow_key
    }

    pub fn escrow_public(&self) -> EcPublicKey {
        EcPublicKey::from_secret_key(&SECP, &self.escrow_key)
    }

    pub fn rating_master(&self) -> &EcSecretKey {
        &self.rating_master
    }

    pub fn keys(&self) -> IdentityKeys {
        IdentityKeys { identity: self.peer_id.as_str().to_string(), secp256k1: self.escrow_public().to_string() }
    }

    pub fn sign(&self, message: &[u8]) -> Result<IdentitySignature, IdentityError> {
        let mut rng = thread_rng();
        let sig = IdentitySchnorr::sign(&self.secret, message, &mut rng)
            .map_err(|e| IdentityError::SigningFailed(e.to_string()))?;
        Ok(IdentitySignature::from_schnorr(&sig))
    }

    /// Signs the node's escrow key with its identity key, binding the two together.
    pub fn sign_escrow_key(&self) -> Result<IdentitySignature, IdentityError> {
        self.sign(self.escrow_public().to_string().as_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let id = NodeIdentity::random();
        let sig = id.sign(b"order-1ORDER_OPEN{}").unwrap();
        assert_eq!(sig.as_str().len(), 128);
        assert!(sig.verify(id.peer_id(), b"order-1ORDER_OPEN{}").is_ok());
        assert!(sig.verify(id.peer_id(), b"order-2ORDER_OPEN{}").is_err());
        let other = NodeIdentity::random();
        assert!(sig.verify(other.peer_id(), b"order-1ORDER_OPEN{}").is_err());
    }

    #[test]
    fn restore_from_hex() {
        let original = NodeIdentity::random();
        let escrow = hex::encode(original.escrow_secret().secret_bytes());
        let rating = hex::encode(original.rating_master().secret_bytes());
        let restored = NodeIdentity::from_hex_keys(&original.secret.to_hex(), &escrow, &rating).unwrap();
        assert_eq!(restored.peer_id(), original.peer_id());
        assert_eq!(restored.escrow_public(), original.escrow_public());
        assert!(NodeIdentity::from_hex_keys("zz", &escrow, &rating).is_err());
        let [_, exported_escrow, exported_rating] = original.to_hex_keys();
        assert_eq!(exported_escrow.reveal(), &escrow);
        assert_eq!(exported_rating.reveal(), &rating);
    }

    #[test]
    fn malformed_signatures() {
        let id = NodeIdentity::random();
        let sig = IdentitySignature("00".into());
        assert!(matches!(sig.verify(id.peer_id(), b"x"), Err(IdentityError::InvalidSignature(_))));
        let bad_peer = PeerId::new("not-a-key");
        let sig = id.sign(b"x").unwrap();
        assert!(matches!(sig.verify(&bad_peer, b"x"), Err(IdentityError::InvalidKey(_))));
        assert!(sig.verify(&PeerId::new("aé"), b"x").is_err());
        let split = IdentitySignature(format!("{}é{}", "a".repeat(63), "a".repeat(63)));
        assert!(matches!(split.verify(id.peer_id(), b"x"), Err(IdentityError::InvalidSignature(_))));
        let wide = IdentitySignature("é".repeat(64));
        assert!(matches!(wide.verify(id.peer_id(), b"x"), Err(IdentityError::InvalidSignature(_))));
    }

    #[test]
    fn escrow_key_binding() {
        let id = NodeIdentity::random();
        let sig = id.sign_escrow_key().unwrap();
        let keys = id.keys();
        assert!(sig.verify(id.peer_id(), keys.secp256k1.as_bytes()).is_ok());
        assert_eq!(keys.escrow_public_key().unwrap(), id.escrow_public());
    }
}
