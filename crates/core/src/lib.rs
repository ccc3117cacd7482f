//! `latchkey-core` — primitives shared by the authorization core.
//!
//! This crate contains no IO: errors, identifiers and the keyset pagination
//! algorithm every listing goes through.

pub mod error;
pub mod id;
pub mod pagination;

pub use error::{AuthError, AuthResult};
pub use id::UserId;
pub use pagination::{
    EntityDescriptor, KeysetQuery, MAX_PAGE_SIZE, Page, PaginationParams, Paginator, paginate,
};
