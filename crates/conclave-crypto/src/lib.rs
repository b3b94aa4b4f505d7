mod api_keys;
mod cipher;
mod jwt;
mod mac;
mod password;
mod paths;
mod sanitize;

pub use api_keys::{ApiKeyRecord, ApiKeyRegistry};
pub use cipher::{decrypt_with_password, encrypt_with_password, EncryptedPayload};
pub use jwt::{Claims, HmacAlgorithm, TokenSigner, TokenType};
pub use mac::{hash_sha256, hmac_sha256, hmac_sha256_hex, timing_safe_eq};
pub use password::{hash_password, verify_password, DEFAULT_BCRYPT_COST, MIN_BCRYPT_COST};
pub use paths::{validate_path, PathPolicy};
pub use sanitize::{contains_sql_injection, sanitize_string};
