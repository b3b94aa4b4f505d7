use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use conclave_types::{Error, Result};

const ALGORITHM: &str = "aes-256-gcm";
const DEFAULT_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Password-encrypted envelope. All binary fields are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
    pub salt: String,
    pub algorithm: String,
    pub iterations: u32,
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

pub fn encrypt_with_password(data: &[u8], password: &str) -> Result<EncryptedPayload> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key_bytes = derive_key(password, &salt, DEFAULT_ITERATIONS);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm appends the 16-byte tag to the ciphertext; the envelope keeps
    // them as separate fields.
    let sealed = cipher
        .encrypt(nonce, Payload::from(data))
        .map_err(|_| Error::Internal("encryption failed".to_string()))?;
    let split = sealed.len() - TAG_LEN;
    let (ciphertext, tag) = sealed.split_at(split);

    Ok(EncryptedPayload {
        ciphertext: BASE64.encode(ciphertext),
        iv: BASE64.encode(nonce_bytes),
        auth_tag: BASE64.encode(tag),
        salt: BASE64.encode(salt),
        algorithm: ALGORITHM.to_string(),
        iterations: DEFAULT_ITERATIONS,
    })
}

pub fn decrypt_with_password(payload: &EncryptedPayload, password: &str) -> Result<Vec<u8>> {
    if payload.algorithm != ALGORITHM {
        return Err(Error::InvalidInput(format!(
            "unsupported cipher algorithm `{}`",
            payload.algorithm
        )));
    }
    let decode = |field: &str, value: &str| {
        BASE64
            .decode(value)
            .map_err(|_| Error::InvalidInput(format!("invalid base64 in `{field}`")))
    };
    let ciphertext = decode("ciphertext", &payload.ciphertext)?;
    let nonce_bytes = decode("iv", &payload.iv)?;
    let tag = decode("auth_tag", &payload.auth_tag)?;
    let salt = decode("salt", &payload.salt)?;
    if nonce_bytes.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(Error::InvalidInput("invalid nonce or tag length".to_string()));
    }

    let key_bytes = derive_key(password, &salt, payload.iterations);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);
    cipher
        .decrypt(nonce, Payload::from(sealed.as_slice()))
        .map_err(|_| Error::Integrity("authentication tag mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_recovers_plaintext() {
        let payload = encrypt_with_password(b"the coordination secret", "pass-123").unwrap();
        assert_eq!(payload.algorithm, "aes-256-gcm");
        let plain = decrypt_with_password(&payload, "pass-123").unwrap();
        assert_eq!(plain, b"the coordination secret");
    }

    #[test]
    fn wrong_password_fails_with_integrity_error() {
        let payload = encrypt_with_password(b"secret", "pass-123").unwrap();
        let err = decrypt_with_password(&payload, "pass-124").err().unwrap();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn tampered_ciphertext_fails_tag_check() {
        let mut payload = encrypt_with_password(b"secret payload bytes", "pw").unwrap();
        let mut raw = BASE64.decode(&payload.ciphertext).unwrap();
        raw[0] ^= 0x01;
        payload.ciphertext = BASE64.encode(raw);
        let err = decrypt_with_password(&payload, "pw").err().unwrap();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn fresh_salt_and_nonce_per_encryption() {
        let a = encrypt_with_password(b"same input", "pw").unwrap();
        let b = encrypt_with_password(b"same input", "pw").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
