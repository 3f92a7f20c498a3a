//! Tag-invalidated read-through cache for query results.
//!
//! Reads are keyed by a fingerprint of (source, query, bindings) combined
//! with the current version of every tag the read carries. Invalidation
//! bumps tag versions instead of deleting entries, so it costs one write
//! per tag no matter how many entries the tag covers.
//!
//! # Example
//!
//! ```ignore
//! let cache = QueryCache::new(QueryCacheConfig::from_env(), registry)?;
//! let conn = cache.connection(db, CacheOptions::new().tag("posts"))?;
//!
//! // First read runs the query, the second is served from the cache.
//! let rows = conn.select("select * from posts where id = ?", &[json!(7)]).await?;
//!
//! // Any later read tagged "posts" recomputes.
//! cache.forget(&["posts"]).await?;
//! ```

pub mod facade;
pub mod invalidation;
pub mod lmdb_backend;
pub mod memory_backend;
pub mod proxy;
pub mod registry;
pub mod source;
pub mod stampede;
pub mod tag_versions;
pub mod traits;

pub use facade::QueryCache;
pub use invalidation::{InvalidationTrigger, MutationEvent, MutationKind, PendingInvalidations};
pub use lmdb_backend::{LmdbCacheError, LmdbCacheStore, LmdbLock};
pub use memory_backend::{InMemoryCacheStore, MemoryLock};
pub use proxy::{CacheOptions, CacheOutcome, CacheRead, QueryCacheProxy, RelationContext, ThroughContext};
pub use registry::StoreRegistry;
pub use source::{unwrap_source, DataSource};
pub use stampede::{HeldLock, LockingMode, StampedeGuard};
pub use tag_versions::TagVersionStore;
pub use traits::{CacheCounters, CacheStats, CacheStore, LockHandle};
