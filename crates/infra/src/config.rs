//! Store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_NAMESPACE: &str = "warden";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
    /// Prefix of cache keys (`{namespace}_groups`, `{namespace}_perms`).
    pub cache_namespace: String,
    pub cache_ttl_secs: u64,
    /// Data-bag keys that identify a user when it has no id yet.
    pub unique_fields: Vec<String>,
    pub redis_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            cache_namespace: DEFAULT_NAMESPACE.to_string(),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            unique_fields: Vec::new(),
            redis_url: None,
        }
    }
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("WARDEN_DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            config.database_url = url;
        }
        if let Some(ns) = lookup("WARDEN_CACHE_NAMESPACE").filter(|v| !v.trim().is_empty()) {
            config.cache_namespace = ns.trim().to_string();
        }
        if let Some(raw) = lookup("WARDEN_CACHE_TTL_SECS") {
            match raw.trim().parse() {
                Ok(secs) => config.cache_ttl_secs = secs,
                Err(_) => warn!(value = %raw, "WARDEN_CACHE_TTL_SECS is not an integer; using default"),
            }
        }
        if let Some(fields) = lookup("WARDEN_UNIQUE_FIELDS") {
            config.unique_fields = fields
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
        }
        config.redis_url = lookup("WARDEN_REDIS_URL").filter(|v| !v.trim().is_empty());
        config
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.cache_namespace = namespace.into();
        self
    }

    pub fn with_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = secs;
        self
    }

    pub fn with_unique_fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.unique_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn groups_key(&self) -> String {
        format!("{}_groups", self.cache_namespace)
    }

    pub fn permissions_key(&self) -> String {
        format!("{}_perms", self.cache_namespace)
    }
}
