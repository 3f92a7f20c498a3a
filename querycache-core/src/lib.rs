//! Query Cache Core - Shared Types
//!
//! Errors, configuration, tags, tag versions and cache-key derivation used
//! by every other query cache crate. No I/O lives here.

pub mod config;
pub mod entry;
pub mod error;
pub mod identity;
pub mod key;
pub mod ttl;

pub use config::QueryCacheConfig;
pub use entry::CacheEntry;
pub use error::{
    BackendError, ConfigError, InputError, QueryCacheError, QueryCacheResult, SourceError,
};
pub use identity::EntityIdentity;
pub use key::{compose_key, CacheKey, CacheKeyDeriver, QueryFingerprint, Tag, TagSet, TagVersion};
pub use ttl::Ttl;

/// One row of a result set, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Opaque result of a read operation.
pub type ResultSet = Vec<Row>;
