//! Configuration loading and representation.

use std::time::Duration;

use serde::Deserialize;

use latchkey_core::{AuthError, AuthResult};

/// Secret used when `LATCHKEY_ENCRYPTION_SECRET` is not set.
pub const INSECURE_DEV_SECRET: &str = "latchkey-insecure-dev-secret";

pub const DEFAULT_CACHE_SIZE: u64 = 1024;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(20);
pub const DEFAULT_CACHE_JITTER: Duration = Duration::from_secs(3);
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-through cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum entries per cached entity kind.
    pub size: u64,
    pub ttl: Duration,
    /// Each entry expires after `ttl` plus or minus up to this much.
    pub eviction_jitter: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: DEFAULT_CACHE_SIZE,
            ttl: DEFAULT_CACHE_TTL,
            eviction_jitter: DEFAULT_CACHE_JITTER,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> AuthResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.size == 0 {
            return Err(AuthError::config("cache size must be at least 1"));
        }
        if self.ttl.is_zero() {
            return Err(AuthError::config("cache ttl must be positive"));
        }
        Ok(())
    }
}

/// Authorization service settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub cache: CacheConfig,
    /// Deadline for every store transaction issued by the service.
    pub tx_timeout: Duration,
    /// Key material for encrypting secrets at rest.
    pub encryption_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            tx_timeout: DEFAULT_TX_TIMEOUT,
            encryption_secret: INSECURE_DEV_SECRET.to_string(),
        }
    }
}

impl AuthConfig {
    /// Load from `LATCHKEY_*` environment variables, falling back to defaults.
    pub fn from_env() -> AuthResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    ///
    /// | Key | Meaning |
    /// |-----|---------|
    /// | `LATCHKEY_CACHE_ENABLED` | `true`/`false` |
    /// | `LATCHKEY_CACHE_SIZE` | entries per kind |
    /// | `LATCHKEY_CACHE_TTL_MS` | entry lifetime |
    /// | `LATCHKEY_CACHE_JITTER_MS` | expiry jitter |
    /// | `LATCHKEY_TX_TIMEOUT_MS` | store transaction deadline |
    /// | `LATCHKEY_ENCRYPTION_SECRET` | secret encryption key material |
    pub fn from_lookup<F>(lookup: F) -> AuthResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let encryption_secret = lookup("LATCHKEY_ENCRYPTION_SECRET").unwrap_or_else(|| {
            tracing::warn!("LATCHKEY_ENCRYPTION_SECRET not set; using insecure dev default");
            defaults.encryption_secret.clone()
        });

        let config = Self {
            cache: CacheConfig {
                enabled: parse(&lookup, "LATCHKEY_CACHE_ENABLED")?.unwrap_or(defaults.cache.enabled),
                size: parse(&lookup, "LATCHKEY_CACHE_SIZE")?.unwrap_or(defaults.cache.size),
                ttl: parse(&lookup, "LATCHKEY_CACHE_TTL_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.cache.ttl),
                eviction_jitter: parse(&lookup, "LATCHKEY_CACHE_JITTER_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.cache.eviction_jitter),
            },
            tx_timeout: parse(&lookup, "LATCHKEY_TX_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.tx_timeout),
            encryption_secret,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AuthResult<()> {
        self.cache.validate()?;
        if self.tx_timeout.is_zero() {
            return Err(AuthError::config("tx_timeout must be positive"));
        }
        if self.encryption_secret.is_empty() {
            return Err(AuthError::config("encryption secret must not be empty"));
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> AuthResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| AuthError::config(format!("{key}: {e}")))
        })
        .transpose()
}
