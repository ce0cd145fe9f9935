use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey};

use crate::helpers::hd_keys::SECP;

/// Signs a 32-byte digest, returning the hex DER signature.
pub fn sign_digest(key: &SecretKey, digest: [u8; 32]) -> String {
    let msg = Message::from_digest(digest);
    let sig = SECP.sign_ecdsa(&msg, key);
    hex::encode(sig.serialize_der())
}

pub fn verify_digest(key: &PublicKey, digest: [u8; 32], signature: &str) -> bool {
    let Ok(bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(sig) = Signature::from_der(&bytes) else {
        return false;
    };
    SECP.verify_ecdsa(&Message::from_digest(digest), &sig, key).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::helpers::hashing::sha256;

    #[test]
    fn der_signatures() {
        let key = SecretKey::new(&mut rand::thread_rng());
        let public = PublicKey::from_secret_key(&SECP, &key);
        let digest = sha256(b"release escrow");
        let sig = sign_digest(&key, digest);
        assert!(verify_digest(&public, digest, &sig));
        assert!(!verify_digest(&public, sha256(b"other"), &sig));
        assert!(!verify_digest(&public, digest, "zz"));
        assert!(!verify_digest(&public, digest, "3006"));
    }
}
