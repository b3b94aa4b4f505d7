use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use conclave_types::{Error, Result};

use crate::mac::{hash_sha256, timing_safe_eq};

/// Metadata for an issued key. The raw key is returned once at issue time
/// and only its SHA-256 is retained.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub label: String,
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Default)]
pub struct ApiKeyRegistry {
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
}

impl ApiKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new key. Returns `(key_id, raw_key)`; the raw key is not
    /// recoverable afterwards.
    pub fn issue(&self, label: impl Into<String>) -> (String, String) {
        let key_id = Uuid::new_v4().simple().to_string();
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let raw = format!("ck_{key_id}_{}", hex::encode(secret));
        let record = ApiKeyRecord {
            key_id: key_id.clone(),
            label: label.into(),
            digest: hash_sha256(raw.as_bytes()),
            created_at: Utc::now(),
            revoked: false,
        };
        self.keys
            .write()
            .expect("api key registry poisoned")
            .insert(key_id.clone(), record);
        (key_id, raw)
    }

    /// Verify a raw key. Returns the key id on success.
    pub fn verify(&self, raw: &str) -> Result<String> {
        let key_id = raw
            .strip_prefix("ck_")
            .and_then(|rest| rest.split('_').next())
            .ok_or_else(|| Error::Unauthorized("malformed API key".to_string()))?;
        let keys = self.keys.read().expect("api key registry poisoned");
        let record = keys
            .get(key_id)
            .ok_or_else(|| Error::Unauthorized("unknown API key".to_string()))?;
        if record.revoked {
            return Err(Error::Unauthorized("API key revoked".to_string()));
        }
        let digest = hash_sha256(raw.as_bytes());
        if !timing_safe_eq(digest.as_bytes(), record.digest.as_bytes()) {
            return Err(Error::Unauthorized("invalid API key".to_string()));
        }
        Ok(record.key_id.clone())
    }

    pub fn revoke(&self, key_id: &str) -> Result<()> {
        let mut keys = self.keys.write().expect("api key registry poisoned");
        let record = keys
            .get_mut(key_id)
            .ok_or_else(|| Error::NotFound(format!("API key `{key_id}`")))?;
        record.revoked = true;
        Ok(())
    }

    pub fn list(&self) -> Vec<ApiKeyRecord> {
        self.keys
            .read()
            .expect("api key registry poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_key_verifies_until_revoked() {
        let registry = ApiKeyRegistry::new();
        let (key_id, raw) = registry.issue("ci");
        assert_eq!(registry.verify(&raw).unwrap(), key_id);

        registry.revoke(&key_id).unwrap();
        assert!(registry.verify(&raw).is_err());
    }

    #[test]
    fn only_digest_is_stored() {
        let registry = ApiKeyRegistry::new();
        let (_, raw) = registry.issue("ci");
        for record in registry.list() {
            assert_ne!(record.digest, raw);
            assert_eq!(record.digest.len(), 64);
        }
    }

    #[test]
    fn mangled_key_is_rejected() {
        let registry = ApiKeyRegistry::new();
        let (_, raw) = registry.issue("ci");
        let mut mangled = raw.clone();
        mangled.pop();
        mangled.push('0');
        assert!(registry.verify(&mangled).is_err() || mangled == raw);
        assert!(registry.verify("not-a-key").is_err());
    }
}
