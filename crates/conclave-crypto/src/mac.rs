use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

pub fn hash_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time equality. The length check short-circuits, which leaks only
/// the length, never the content.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_is_deterministic_and_key_sensitive() {
        let a = hmac_sha256_hex(b"key-1", b"payload");
        let b = hmac_sha256_hex(b"key-1", b"payload");
        let c = hmac_sha256_hex(b"key-2", b"payload");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            hash_sha256(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn timing_safe_eq_handles_length_mismatch() {
        assert!(timing_safe_eq(b"same", b"same"));
        assert!(!timing_safe_eq(b"same", b"different"));
        assert!(!timing_safe_eq(b"same", b"sam"));
    }
}
