//! Infrastructure layer: SQLite persistence and caching for the
//! authorization graph.

pub mod cache;
pub mod config;
pub mod error;
pub mod pool;
pub mod reconciler;
pub mod schema;

#[cfg(feature = "redis")]
pub use cache::RedisCache;
pub use cache::{Cache, CacheError, InMemoryCache};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use pool::create_pool;
pub use reconciler::Reconciler;
