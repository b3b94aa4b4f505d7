use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use conclave_crypto::{hash_password, verify_password, ApiKeyRegistry, Claims, TokenSigner, TokenType};
use conclave_types::{Error, Result};

use crate::audit::{AuditEventInput, AuditLog, AuditSeverity};
use crate::rbac::{RbacStore, Role};

const ACCESS_TTL_SECS: u64 = 15 * 60;
const REFRESH_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_secs: u64,
}

/// Login, token refresh, and API-key verification, with every
/// security-relevant action recorded in the audit log.
pub struct AuthService {
    signer: TokenSigner,
    api_keys: ApiKeyRegistry,
    rbac: Arc<RbacStore>,
    audit: Arc<AuditLog>,
    password_hashes: RwLock<HashMap<String, String>>,
}

impl AuthService {
    pub fn new(signer: TokenSigner, rbac: Arc<RbacStore>, audit: Arc<AuditLog>) -> Self {
        Self {
            signer,
            api_keys: ApiKeyRegistry::new(),
            rbac,
            audit,
            password_hashes: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_user(&self, user_id: &str, password: &str, role: Role) -> Result<()> {
        let hashed = hash_password(password, None)?;
        self.password_hashes
            .write()
            .expect("password map poisoned")
            .insert(user_id.to_string(), hashed);
        self.rbac.upsert_user(user_id, role);
        self.audit.log(
            AuditEventInput::new("auth.user.created")
                .user(user_id)
                .details(serde_json::json!({ "role": role })),
        );
        Ok(())
    }

    pub fn login(&self, user_id: &str, password: &str) -> Result<TokenPair> {
        let hashed = self
            .password_hashes
            .read()
            .expect("password map poisoned")
            .get(user_id)
            .cloned();
        let verified = match hashed {
            Some(hashed) => verify_password(password, &hashed)?,
            None => false,
        };
        if !verified {
            self.audit.log(
                AuditEventInput::new("auth.login")
                    .severity(AuditSeverity::Warning)
                    .user(user_id)
                    .failure("invalid credentials"),
            );
            return Err(Error::Unauthorized("invalid credentials".to_string()));
        }
        let pair = self.issue_pair(user_id)?;
        self.audit
            .log(AuditEventInput::new("auth.login").user(user_id));
        Ok(pair)
    }

    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.signer.verify(refresh_token)?;
        if claims.token_type != TokenType::Refresh {
            self.audit.log(
                AuditEventInput::new("auth.refresh")
                    .severity(AuditSeverity::Warning)
                    .user(&claims.sub)
                    .failure("wrong token type"),
            );
            return Err(Error::Unauthorized(
                "refresh requires a refresh token".to_string(),
            ));
        }
        // One-shot refresh tokens: the old one is revoked on use.
        self.signer.revoke(&claims.jti);
        let pair = self.issue_pair(&claims.sub)?;
        self.audit
            .log(AuditEventInput::new("auth.refresh").user(&claims.sub));
        Ok(pair)
    }

    pub fn verify_access(&self, token: &str) -> Result<Claims> {
        let claims = self.signer.verify(token)?;
        if claims.token_type != TokenType::Access {
            return Err(Error::Unauthorized("not an access token".to_string()));
        }
        Ok(claims)
    }

    pub fn revoke_token(&self, jti: &str) {
        self.signer.revoke(jti);
        self.audit.log(
            AuditEventInput::new("auth.token.revoked")
                .details(serde_json::json!({ "jti": jti })),
        );
    }

    pub fn issue_api_key(&self, user_id: &str, label: &str) -> (String, String) {
        let (key_id, raw) = self.api_keys.issue(label);
        self.audit.log(
            AuditEventInput::new("auth.api_key.issued")
                .user(user_id)
                .details(serde_json::json!({ "keyID": key_id, "label": label })),
        );
        (key_id, raw)
    }

    pub fn verify_api_key(&self, raw: &str) -> Result<String> {
        match self.api_keys.verify(raw) {
            Ok(key_id) => Ok(key_id),
            Err(err) => {
                self.audit.log(
                    AuditEventInput::new("auth.api_key.rejected")
                        .severity(AuditSeverity::Warning)
                        .failure(err.to_string()),
                );
                Err(err)
            }
        }
    }

    pub fn revoke_api_key(&self, user_id: &str, key_id: &str) -> Result<()> {
        self.api_keys.revoke(key_id)?;
        self.audit.log(
            AuditEventInput::new("auth.api_key.revoked")
                .user(user_id)
                .details(serde_json::json!({ "keyID": key_id })),
        );
        Ok(())
    }

    pub fn set_role(&self, actor_id: &str, target_id: &str, role: Role) -> Result<()> {
        match self.rbac.set_role(actor_id, target_id, role) {
            Ok(()) => {
                self.audit.log(
                    AuditEventInput::new("rbac.role.changed")
                        .user(actor_id)
                        .resource("user", target_id)
                        .details(serde_json::json!({ "role": role })),
                );
                Ok(())
            }
            Err(err) => {
                self.audit.log(
                    AuditEventInput::new("rbac.role.changed")
                        .severity(AuditSeverity::Warning)
                        .user(actor_id)
                        .resource("user", target_id)
                        .failure(err.to_string()),
                );
                Err(err)
            }
        }
    }

    fn issue_pair(&self, user_id: &str) -> Result<TokenPair> {
        let scopes = self
            .rbac
            .get_user(user_id)
            .map(|user| vec![format!("role:{:?}", user.role).to_lowercase()])
            .unwrap_or_default();
        let (access_token, _) =
            self.signer
                .sign(user_id, TokenType::Access, scopes.clone(), ACCESS_TTL_SECS)?;
        let (refresh_token, _) =
            self.signer
                .sign(user_id, TokenType::Refresh, scopes, REFRESH_TTL_SECS)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in_secs: ACCESS_TTL_SECS,
        })
    }
}
