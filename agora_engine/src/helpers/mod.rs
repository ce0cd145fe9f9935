mod ecdsa;
pub mod hashing;
pub mod hd_keys;
mod identity;
mod sanitize;

pub use ecdsa::{sign_digest, verify_digest};
pub use hd_keys::{derive_child_public, derive_child_secret, ChainCode, KeyDerivationError, SECP};
pub use identity::{
    hex_to_schnorr,
    public_key_for_peer,
    IdentityError,
    IdentityKeys,
    IdentitySchnorr,
    IdentitySignature,
    NodeIdentity,
};
pub use sanitize::{sanitize, sanitize_text, sanitize_value};
