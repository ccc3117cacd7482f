//! Transactional store boundary.
//!
//! The façade never sees SQL. It opens a [`Tx`] with [`Database::begin`],
//! issues typed operations against it and either commits or drops it. Dropping
//! an uncommitted transaction rolls it back, on every exit path.
//!
//! Listing operations take a [`KeysetQuery`] planned by the shared paginator
//! and must return rows ascending by its cursor column, strictly after
//! `after`, starting with `prefix`, and at most `limit` of them.
//!
//! Relation operations take display names. The caller resolves both endpoints
//! first; a store only has to enforce uniqueness of the relation itself.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use latchkey_auth::{Credential, CredentialRecord, Group, Policy, User};
use latchkey_core::{AuthError, KeysetQuery, UserId};

pub use memory::InMemoryAuthStore;
pub use postgres::PostgresAuthStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unique violation in {operation}: {message}")]
    UniqueViolation {
        operation: &'static str,
        message: String,
    },

    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    /// Timeouts, cancellations, lost connections and serialization
    /// conflicts. Retrying the same request may succeed.
    #[error("transient failure in {operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },

    #[error("failed to decode row in {operation}: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },

    #[error("connection pool closed in {0}")]
    PoolClosed(&'static str),

    #[error("write attempted in read-only transaction: {0}")]
    ReadOnly(&'static str),
}

impl StoreError {
    pub fn operation(&self) -> &'static str {
        match self {
            StoreError::UniqueViolation { operation, .. }
            | StoreError::Database { operation, .. }
            | StoreError::Transient { operation, .. }
            | StoreError::Decode { operation, .. } => operation,
            StoreError::PoolClosed(operation) | StoreError::ReadOnly(operation) => operation,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::StoreUnavailable {
            operation: err.operation(),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_stay_retryable() {
        let err: AuthError = StoreError::Transient {
            operation: "get_user",
            message: "canceling statement due to statement timeout".into(),
        }
        .into();
        assert!(err.is_retryable());
        assert!(matches!(err, AuthError::StoreUnavailable { operation: "get_user", .. }));
    }

    #[test]
    fn other_failures_are_not_retryable() {
        let err: AuthError = StoreError::Database {
            operation: "insert_user",
            message: "syntax error".into(),
        }
        .into();
        assert!(!err.is_retryable());
    }
}

/// Source of transactions.
#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self, mode: TxMode) -> StoreResult<Box<dyn Tx>>;
}

/// One open transaction.
///
/// Deletes return the number of rows removed so callers can surface a
/// not-found instead of silently succeeding.
#[async_trait]
pub trait Tx: Send {
    // users
    async fn insert_user(&mut self, user: &User) -> StoreResult<()>;
    async fn get_user_by_name(&mut self, username: &str) -> StoreResult<Option<User>>;
    async fn get_user_by_id(&mut self, id: UserId) -> StoreResult<Option<User>>;
    async fn get_user_by_email(&mut self, email: &str) -> StoreResult<Option<User>>;
    async fn list_users(&mut self, query: &KeysetQuery) -> StoreResult<Vec<User>>;
    async fn delete_user(&mut self, username: &str) -> StoreResult<u64>;

    // groups
    async fn insert_group(&mut self, group: &Group) -> StoreResult<()>;
    async fn get_group(&mut self, name: &str) -> StoreResult<Option<Group>>;
    async fn list_groups(&mut self, query: &KeysetQuery) -> StoreResult<Vec<Group>>;
    async fn delete_group(&mut self, name: &str) -> StoreResult<u64>;

    // policies
    /// Insert, or replace the statements of the policy with the same name.
    async fn upsert_policy(&mut self, policy: &Policy) -> StoreResult<()>;
    async fn get_policy(&mut self, name: &str) -> StoreResult<Option<Policy>>;
    async fn list_policies(&mut self, query: &KeysetQuery) -> StoreResult<Vec<Policy>>;
    async fn delete_policy(&mut self, name: &str) -> StoreResult<u64>;

    // user <-> group
    async fn insert_user_group(&mut self, username: &str, group: &str) -> StoreResult<()>;
    async fn delete_user_group(&mut self, username: &str, group: &str) -> StoreResult<u64>;
    async fn list_user_groups(&mut self, username: &str, query: &KeysetQuery) -> StoreResult<Vec<Group>>;
    async fn list_group_users(&mut self, group: &str, query: &KeysetQuery) -> StoreResult<Vec<User>>;

    // policy <-> user
    async fn insert_user_policy(&mut self, username: &str, policy: &str) -> StoreResult<()>;
    async fn delete_user_policy(&mut self, username: &str, policy: &str) -> StoreResult<u64>;
    async fn list_user_policies(&mut self, username: &str, query: &KeysetQuery) -> StoreResult<Vec<Policy>>;

    // policy <-> group
    async fn insert_group_policy(&mut self, group: &str, policy: &str) -> StoreResult<()>;
    async fn delete_group_policy(&mut self, group: &str, policy: &str) -> StoreResult<u64>;
    async fn list_group_policies(&mut self, group: &str, query: &KeysetQuery) -> StoreResult<Vec<Policy>>;

    /// Policies attached to the user directly or through any of its groups,
    /// each policy at most once.
    async fn list_effective_policies(&mut self, username: &str, query: &KeysetQuery) -> StoreResult<Vec<Policy>>;

    // credentials
    async fn insert_credential(&mut self, record: &CredentialRecord) -> StoreResult<()>;
    async fn get_credential(&mut self, access_key_id: &str) -> StoreResult<Option<CredentialRecord>>;
    /// Listed credentials never carry their secret.
    async fn list_user_credentials(&mut self, user_id: UserId, query: &KeysetQuery) -> StoreResult<Vec<Credential>>;
    async fn delete_credential(&mut self, user_id: UserId, access_key_id: &str) -> StoreResult<u64>;

    // replayed tokens
    /// Insert the token unless it is already present. `true` when this call
    /// added the row.
    async fn insert_token_if_absent(&mut self, token_id: &str, expires_at: DateTime<Utc>) -> StoreResult<bool>;
    async fn delete_expired_tokens(&mut self, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
