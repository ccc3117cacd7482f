//! Infrastructure layer: stores, caching, configuration and the
//! authorization service built on top of them.

pub mod cache;
pub mod config;
pub mod service;
pub mod store;


pub use cache::{EntryCache, LruCache, NoOpCache, ServiceCache};
pub use config::{AuthConfig, CacheConfig};
pub use service::AuthService;
pub use store::{Database, InMemoryAuthStore, PostgresAuthStore, StoreError, Tx, TxMode};
