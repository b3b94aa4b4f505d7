use std::collections::HashSet;
use std::sync::RwLock;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conclave_types::{Error, Result};

const MIN_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlgorithm {
    HS256,
    HS384,
    HS512,
}

impl HmacAlgorithm {
    fn to_jwt(self) -> Algorithm {
        match self {
            HmacAlgorithm::HS256 => Algorithm::HS256,
            HmacAlgorithm::HS384 => Algorithm::HS384,
            HmacAlgorithm::HS512 => Algorithm::HS512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    ApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub jti: String,
}

/// Signs and verifies HMAC JWTs. Revocation is tracked by `jti` for the
/// lifetime of the signer.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: HmacAlgorithm,
    revoked: RwLock<HashSet<String>>,
}

impl TokenSigner {
    pub fn new(secret: &[u8], algorithm: HmacAlgorithm) -> Result<Self> {
        if secret.len() < MIN_SECRET_BYTES {
            return Err(Error::InvalidInput(format!(
                "JWT secret must be at least {MIN_SECRET_BYTES} bytes, got {}",
                secret.len()
            )));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            algorithm,
            revoked: RwLock::new(HashSet::new()),
        })
    }

    pub fn sign(
        &self,
        sub: impl Into<String>,
        token_type: TokenType,
        scopes: Vec<String>,
        ttl_secs: u64,
    ) -> Result<(String, Claims)> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            sub: sub.into(),
            iat: now,
            exp: now + ttl_secs,
            token_type,
            scopes,
            jti: Uuid::new_v4().to_string(),
        };
        let header = Header::new(self.algorithm.to_jwt());
        let token = encode(&header, &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("JWT signing failed: {e}")))?;
        Ok((token, claims))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm.to_jwt());
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind::*;
            match e.kind() {
                ExpiredSignature => Error::Unauthorized("token expired".to_string()),
                InvalidSignature => Error::Unauthorized("bad token signature".to_string()),
                InvalidToken | Base64(_) | Json(_) | Utf8(_) => {
                    Error::InvalidInput("malformed token".to_string())
                }
                InvalidAlgorithm => Error::InvalidInput("unexpected token algorithm".to_string()),
                _ => Error::Unauthorized(format!("token rejected: {e}")),
            }
        })?;
        if self
            .revoked
            .read()
            .expect("revocation set poisoned")
            .contains(&data.claims.jti)
        {
            return Err(Error::Unauthorized("token revoked".to_string()));
        }
        Ok(data.claims)
    }

    pub fn revoke(&self, jti: &str) {
        self.revoked
            .write()
            .expect("revocation set poisoned")
            .insert(jti.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn signer() -> TokenSigner {
        TokenSigner::new(SECRET, HmacAlgorithm::HS256).expect("signer")
    }

    #[test]
    fn rejects_short_secret() {
        let err = TokenSigner::new(b"too-short", HmacAlgorithm::HS256).err();
        assert!(matches!(err, Some(Error::InvalidInput(_))));
    }

    #[test]
    fn round_trip_preserves_claims() {
        let signer = signer();
        let (token, issued) = signer
            .sign("user-1", TokenType::Access, vec!["agents:read".into()], 60)
            .expect("sign");
        let claims = signer.verify(&token).expect("verify");
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(claims.scopes, vec!["agents:read".to_string()]);
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = signer();
        let (token, _) = signer
            .sign("user-1", TokenType::Access, Vec::new(), 0)
            .expect("sign");
        std::thread::sleep(std::time::Duration::from_millis(1_100));
        let err = signer.verify(&token).err().expect("expired");
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn tampered_token_fails_signature_check() {
        let signer = signer();
        let (token, _) = signer
            .sign("user-1", TokenType::Access, Vec::new(), 60)
            .expect("sign");
        let mut parts: Vec<String> = token.split('.').map(ToString::to_string).collect();
        parts[2] = parts[2].chars().rev().collect();
        assert!(signer.verify(&parts.join(".")).is_err());
    }

    #[test]
    fn revoked_jti_is_rejected() {
        let signer = signer();
        let (token, claims) = signer
            .sign("user-1", TokenType::Refresh, Vec::new(), 60)
            .expect("sign");
        signer.revoke(&claims.jti);
        let err = signer.verify(&token).err().expect("revoked");
        assert!(err.to_string().contains("revoked"));
    }

    #[test]
    fn other_signer_rejects_foreign_token() {
        let signer = signer();
        let other =
            TokenSigner::new(b"ffffffffffffffffffffffffffffffff", HmacAlgorithm::HS256).unwrap();
        let (token, _) = signer
            .sign("user-1", TokenType::Access, Vec::new(), 60)
            .expect("sign");
        assert!(other.verify(&token).is_err());
    }
}
