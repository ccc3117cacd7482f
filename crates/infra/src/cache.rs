//! Read-through cache for hot authorization lookups.
//!
//! Each entity kind gets its own [`EntryCache`]. [`LruCache`] bounds entries
//! by count with least-recently-used eviction and expires each entry after the
//! configured TTL plus or minus a random jitter, so entries loaded together do
//! not all expire together. [`NoOpCache`] never stores anything.
//!
//! Concurrent misses for the same key may each call the loader. Nothing is
//! cached when the loader fails.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use rand::Rng;
use tracing::trace;

use latchkey_auth::{Credential, Policy, User};
use latchkey_core::{AuthResult, UserId};

use crate::config::CacheConfig;

/// Cache capability for one entity kind.
#[async_trait]
pub trait EntryCache<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V>;
    async fn insert(&self, key: String, value: V);
    async fn invalidate(&self, key: &str);
    fn invalidate_all(&self);
}

/// Return the cached value for `key`, or load, cache and return it.
pub async fn read_through<V, F, Fut>(cache: &dyn EntryCache<V>, key: &str, loader: F) -> AuthResult<V>
where
    V: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = AuthResult<V>>,
{
    if let Some(value) = cache.get(key).await {
        trace!(key, "cache hit");
        return Ok(value);
    }
    trace!(key, "cache miss");
    let value = loader().await?;
    cache.insert(key.to_string(), value.clone()).await;
    Ok(value)
}

/// Expiry of `ttl` shifted by a uniform offset in `[-jitter, +jitter]`,
/// never below one millisecond.
pub fn jittered_ttl(ttl: Duration, jitter: Duration) -> Duration {
    let jitter_ms = i64::try_from(jitter.as_millis()).unwrap_or(i64::MAX);
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    if jitter_ms == 0 {
        return ttl;
    }
    let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
    let millis = ttl_ms.saturating_add(offset).max(1);
    Duration::from_millis(millis as u64)
}

struct JitteredExpiry {
    ttl: Duration,
    jitter: Duration,
}

impl<V> moka::Expiry<String, V> for JitteredExpiry {
    fn expire_after_create(&self, _key: &String, _value: &V, _created_at: Instant) -> Option<Duration> {
        Some(jittered_ttl(self.ttl, self.jitter))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        _value: &V,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(jittered_ttl(self.ttl, self.jitter))
    }
}

/// Capacity-bounded LRU cache with jittered per-entry expiry.
#[derive(Clone)]
pub struct LruCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    entries: Cache<String, V>,
}

impl<V> LruCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(size: u64, ttl: Duration, jitter: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(size)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(JitteredExpiry { ttl, jitter })
            .build();
        Self { entries }
    }

    /// Approximate number of live entries.
    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

#[async_trait]
impl<V> EntryCache<V> for LruCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).await
    }

    async fn insert(&self, key: String, value: V) {
        self.entries.insert(key, value).await;
    }

    async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }
}

/// Cache that never stores anything; every lookup calls through.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCache;

#[async_trait]
impl<V> EntryCache<V> for NoOpCache
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, _key: &str) -> Option<V> {
        None
    }

    async fn insert(&self, _key: String, _value: V) {}

    async fn invalidate(&self, _key: &str) {}

    fn invalidate_all(&self) {}
}

fn build<V>(config: &CacheConfig) -> Arc<dyn EntryCache<V>>
where
    V: Clone + Send + Sync + 'static,
{
    if config.enabled {
        Arc::new(LruCache::new(config.size, config.ttl, config.eviction_jitter))
    } else {
        Arc::new(NoOpCache)
    }
}

/// The caches used by the authorization service, one per entity kind.
#[derive(Clone)]
pub struct ServiceCache {
    users_by_name: Arc<dyn EntryCache<User>>,
    users_by_id: Arc<dyn EntryCache<User>>,
    credentials: Arc<dyn EntryCache<Credential>>,
    effective_policies: Arc<dyn EntryCache<Arc<[Policy]>>>,
}

impl ServiceCache {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            users_by_name: build(config),
            users_by_id: build(config),
            credentials: build(config),
            effective_policies: build(config),
        }
    }

    pub fn disabled() -> Self {
        Self::from_config(&CacheConfig::disabled())
    }

    pub async fn get_user<F, Fut>(&self, username: &str, loader: F) -> AuthResult<User>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<User>>,
    {
        read_through(self.users_by_name.as_ref(), username, loader).await
    }

    pub async fn get_user_by_id<F, Fut>(&self, id: UserId, loader: F) -> AuthResult<User>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<User>>,
    {
        read_through(self.users_by_id.as_ref(), &id.to_string(), loader).await
    }

    pub async fn get_credential<F, Fut>(&self, access_key_id: &str, loader: F) -> AuthResult<Credential>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<Credential>>,
    {
        read_through(self.credentials.as_ref(), access_key_id, loader).await
    }

    pub async fn get_effective_policies<F, Fut>(&self, username: &str, loader: F) -> AuthResult<Arc<[Policy]>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AuthResult<Arc<[Policy]>>>,
    {
        read_through(self.effective_policies.as_ref(), username, loader).await
    }

    /// Drop everything cached about one user.
    ///
    /// The credential cache is keyed by access key id, so all of it goes: a
    /// deleted user's credentials are deleted with it.
    pub async fn invalidate_user(&self, user: &User) {
        self.users_by_name.invalidate(&user.username).await;
        self.users_by_id.invalidate(&user.id.to_string()).await;
        self.effective_policies.invalidate(&user.username).await;
        self.credentials.invalidate_all();
    }

    pub async fn invalidate_credential(&self, access_key_id: &str) {
        self.credentials.invalidate(access_key_id).await;
    }

    pub async fn invalidate_effective_policies(&self, username: &str) {
        self.effective_policies.invalidate(username).await;
    }

    /// Group and policy mutations can change any user's effective set.
    pub fn invalidate_all_effective_policies(&self) {
        self.effective_policies.invalidate_all();
    }
}

impl std::fmt::Debug for ServiceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use latchkey_core::AuthError;

    #[test]
    fn jitter_stays_within_bounds() {
        let ttl = Duration::from_secs(20);
        let jitter = Duration::from_secs(3);
        for _ in 0..1000 {
            let d = jittered_ttl(ttl, jitter);
            assert!(d >= Duration::from_secs(17) && d <= Duration::from_secs(23), "{d:?}");
        }
    }

    #[test]
    fn jitter_never_reaches_zero() {
        for _ in 0..100 {
            assert!(jittered_ttl(Duration::from_millis(1), Duration::from_secs(1)) >= Duration::from_millis(1));
        }
        assert_eq!(jittered_ttl(Duration::from_secs(5), Duration::ZERO), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let cache: LruCache<String> = LruCache::new(16, Duration::from_secs(60), Duration::ZERO);
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = read_through(&cache, "k", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok("v".to_string())
            })
            .await
            .unwrap();
            assert_eq!(value, "v");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn noop_always_calls_through() {
        let cache = NoOpCache;
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            read_through::<String, _, _>(&cache, "k", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok("v".to_string())
            })
            .await
            .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let cache: LruCache<String> = LruCache::new(16, Duration::from_secs(60), Duration::ZERO);
        let err = read_through(&cache, "k", || async { Err(AuthError::not_found("user", "k")) })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache: LruCache<String> = LruCache::new(16, Duration::from_millis(50), Duration::ZERO);
        cache.insert("k".into(), "v".into()).await;
        assert!(cache.get("k").await.is_some());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let cache: LruCache<u32> = LruCache::new(8, Duration::from_secs(60), Duration::ZERO);
        for i in 0..64u32 {
            cache.insert(format!("k{i}"), i).await;
        }
        assert!(cache.entry_count().await <= 8);
    }

    #[tokio::test]
    async fn invalidation_forces_reload() {
        let cache: LruCache<String> = LruCache::new(16, Duration::from_secs(60), Duration::ZERO);
        cache.insert("k".into(), "old".into()).await;
        cache.invalidate("k").await;
        let value = read_through(&cache, "k", || async { Ok("new".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "new");
    }
}
