//! Key/value cache in front of the permission catalog and group grants.
//!
//! The cache is an optimisation only: callers treat every failure as a miss.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cached value is corrupt: {0}")]
    Corrupt(String),
}

pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError>;

    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Process-local cache with per-entry expiry.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (Value, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> CacheError {
        CacheError::Unavailable("cache lock poisoned".to_string())
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(key.to_string(), (value.clone(), Instant::now() + ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.remove(key);
        Ok(())
    }
}

/// Redis-backed cache storing JSON strings with `SET .. EX`.
#[cfg(feature = "redis")]
#[derive(Debug, Clone)]
pub struct RedisCache {
    client: std::sync::Arc<redis::Client>,
}

#[cfg(feature = "redis")]
impl RedisCache {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: std::sync::Arc::new(client),
        })
    }

    fn connection(&self) -> Result<redis::Connection, CacheError> {
        self.client
            .get_connection()
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

#[cfg(feature = "redis")]
impl Cache for RedisCache {
    fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        raw.map(|s| serde_json::from_str(&s).map_err(|e| CacheError::Corrupt(e.to_string())))
            .transpose()
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value.to_string())
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query(&mut conn)
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
