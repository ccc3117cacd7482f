//! `latchkey-auth` — pure authorization domain.
//!
//! Entities, validation, pattern matching, permission evaluation and
//! credential material. This crate is intentionally decoupled from storage,
//! caching and transport.

pub mod check;
pub mod claims;
pub mod crypt;
pub mod keys;
pub mod matching;
pub mod model;
pub mod permissions;
pub mod validate;

pub use check::{AuthorizationRequest, AuthorizationResponse, CheckResult, check_permissions};
pub use claims::IdentityClaims;
pub use crypt::{FernetSecretStore, SecretStore};
pub use keys::{
    generate_access_key_id, generate_secret_access_key, is_valid_access_key_id,
    validate_credentials,
};
pub use model::{
    Credential, CredentialRecord, Effect, Group, Policy, Statement, USER_SOURCE_INTERNAL,
    USER_SOURCE_OIDC, User,
};
pub use permissions::{Node, Permission};
