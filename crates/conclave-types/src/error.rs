use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    Forbidden,
    NotFound,
    InvalidState,
    CapacityExceeded,
    Timeout,
    ProviderFailure,
    IntegrityFailure,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("provider `{provider}` failed: {message}")]
    Provider {
        provider: String,
        message: String,
        retryable: bool,
        /// Whether the manager attempted failover before surfacing this.
        retried: bool,
    },

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Provider { .. } => ErrorKind::ProviderFailure,
            Error::Integrity(_) => ErrorKind::IntegrityFailure,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::CapacityExceeded(_) => true,
            Error::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn provider_failure(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provider {
            provider: provider.into(),
            message: message.into(),
            retryable: true,
            retried: false,
        }
    }

    pub fn to_wire(&self) -> WireError {
        let details = match self {
            Error::Provider {
                provider, retried, ..
            } => Some(serde_json::json!({
                "provider": provider,
                "retried": retried,
            })),
            _ => None,
        };
        WireError {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.retryable(),
            details,
        }
    }
}

/// The structured error shape surfaced to callers and mirrored onto the
/// event stream as `*:failed` / `llm:request:error` payloads.
#[derive(Debug, Clone, Serialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_carry_origin_in_wire_details() {
        let err = Error::Provider {
            provider: "openai".to_string(),
            message: "boom".to_string(),
            retryable: true,
            retried: true,
        };
        let wire = err.to_wire();
        assert_eq!(wire.kind, ErrorKind::ProviderFailure);
        assert!(wire.retryable);
        let details = wire.details.expect("details");
        assert_eq!(details["provider"], "openai");
        assert_eq!(details["retried"], true);
    }

    #[test]
    fn timeouts_are_retryable_and_validation_is_not() {
        assert!(Error::Timeout("request".into()).retryable());
        assert!(!Error::InvalidInput("bad field".into()).retryable());
    }
}
