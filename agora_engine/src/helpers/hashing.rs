use blake2::{digest::consts::U32, Blake2b, Digest};
use sha2::Sha256;

type Blake2b256 = Blake2b<U32>;

pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn blake2b_hex(data: &[u8]) -> String {
    hex::encode(blake2b_256(data))
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digests() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let a = blake2b_hex(b"order");
        assert_eq!(a.len(), 64);
        assert_eq!(a, blake2b_hex(b"order"));
        assert_ne!(a, blake2b_hex(b"order2"));
    }
}
