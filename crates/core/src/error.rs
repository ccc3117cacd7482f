//! Authorization error model.

use thiserror::Error;

/// Result type used across the authorization core.
pub type AuthResult<T> = Result<T, AuthError>;

/// Error surface of the authorization core.
///
/// Every variant carries the offending key so callers can report it without
/// re-deriving context. `InsufficientPermissions` is a normal negative
/// decision rather than a fault; it travels inside an authorization response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// An entity or relation does not exist.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// A uniqueness constraint was violated on create or attach.
    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: &'static str, key: String },

    /// An identifier, action pattern, resource pattern or effect was rejected.
    #[error("validation failed for {field} '{value}': {reason}")]
    Validation {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid access key id: {0}")]
    InvalidAccessKeyId(String),

    #[error("invalid secret access key")]
    InvalidSecretAccessKey,

    #[error("insufficient permissions for user {username}")]
    InsufficientPermissions { username: String },

    /// The token id was already claimed.
    #[error("invalid token: {token_id}")]
    InvalidToken { token_id: String },

    /// Transport or transaction failure in the underlying store.
    #[error("store unavailable during {operation}: {message}")]
    StoreUnavailable {
        operation: &'static str,
        message: String,
        retryable: bool,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("secret encryption failed: {0}")]
    Crypto(String),
}

impl AuthError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn already_exists(entity: &'static str, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            key: key.into(),
        }
    }

    pub fn validation(
        field: &'static str,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn store(operation: &'static str, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(operation: &'static str) -> Self {
        Self::StoreUnavailable {
            operation,
            message: "transaction deadline exceeded".to_string(),
            retryable: true,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable {
                retryable: true,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_key() {
        let err = AuthError::not_found("user", "alice");
        assert_eq!(err.to_string(), "user not found: alice");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeouts_are_retryable() {
        let err = AuthError::timeout("get_user");
        assert!(err.is_retryable());
        assert!(!AuthError::store("get_user", "boom").is_retryable());
    }
}
