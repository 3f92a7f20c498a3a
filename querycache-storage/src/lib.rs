//! Query Cache Storage - Stores, Proxy and Invalidation
//!
//! Cache store backends (in-memory and LMDB), tag versioning, stampede
//! protection, the caching data-source proxy and the invalidation trigger.

pub mod cache;

pub use cache::{
    unwrap_source, CacheCounters, CacheOptions, CacheOutcome, CacheRead, CacheStats, CacheStore,
    DataSource, HeldLock, InMemoryCacheStore, InvalidationTrigger, LmdbCacheError,
    LmdbCacheStore, LockHandle, LockingMode, MutationEvent, MutationKind, PendingInvalidations,
    QueryCache, QueryCacheProxy, RelationContext, StampedeGuard, StoreRegistry, TagVersionStore,
    ThroughContext,
};
