//! Cache store traits and usage counters.
//!
//! This module defines what a key-value backend must provide for the query
//! cache: plain get/put with TTL, an atomic set-if-absent for tag versions,
//! and two optional capabilities (named locks and tag sets).

use async_trait::async_trait;
use querycache_core::{BackendError, QueryCacheResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Pluggable key-value backend.
///
/// Implementations must be safe under concurrent use from many tasks and
/// from other processes sharing the same storage. `ttl: None` means the
/// value never expires on its own.
///
/// # Capabilities
///
/// Locking and tag sets are optional. A store advertises them through
/// `supports_locking` / `supports_tagging`; the default method bodies
/// report `UnsupportedCapability`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Human-readable store name used in errors and logs.
    fn name(&self) -> &str;

    /// Get a value. Expired values are reported as absent.
    async fn get(&self, key: &str) -> QueryCacheResult<Option<Vec<u8>>>;

    /// Put a value, replacing any previous one.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> QueryCacheResult<()>;

    /// Put a value only if the key is absent (or expired).
    ///
    /// Returns true when this call wrote the value. Must be atomic: of many
    /// concurrent callers at most one observes `true`.
    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> QueryCacheResult<bool>;

    /// Put several values as one step.
    async fn put_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> QueryCacheResult<()> {
        for (key, value) in entries {
            self.put(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// Remove a value. Returns true if something was removed.
    async fn forget(&self, key: &str) -> QueryCacheResult<bool>;

    fn supports_locking(&self) -> bool {
        false
    }

    /// Acquire the named lock, waiting up to `wait` for the current holder.
    ///
    /// The lock is held for at most `lease` even if never released.
    async fn lock(
        &self,
        _name: &str,
        _lease: Duration,
        _wait: Duration,
    ) -> QueryCacheResult<Box<dyn LockHandle>> {
        Err(unsupported(self.name(), "atomic locks"))
    }

    fn supports_tagging(&self) -> bool {
        false
    }

    /// Register `entry_key` as a member of the tag set `tag_key`.
    ///
    /// Membership expires with the entry. An existing membership is kept
    /// unchanged.
    async fn add_tag_entry(
        &self,
        _tag_key: &str,
        _entry_key: &str,
        _ttl: Duration,
    ) -> QueryCacheResult<()> {
        Err(unsupported(self.name(), "tagging"))
    }

    /// Live members of a tag set.
    async fn tag_entries(&self, _tag_key: &str) -> QueryCacheResult<Vec<String>> {
        Err(unsupported(self.name(), "tagging"))
    }

    /// Delete every member of a tag set and the set itself.
    ///
    /// Returns the number of entries removed.
    async fn flush_tag(&self, _tag_key: &str) -> QueryCacheResult<u64> {
        Err(unsupported(self.name(), "tagging"))
    }
}

/// A held lock. Releasing must be idempotent.
pub trait LockHandle: Send + Sync {
    fn name(&self) -> &str;

    fn release(&mut self);
}

pub(crate) fn unsupported(store: &str, capability: &str) -> querycache_core::QueryCacheError {
    BackendError::UnsupportedCapability {
        store: store.to_string(),
        capability: capability.to_string(),
    }
    .into()
}

/// Snapshot of cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from the cache.
    pub hits: u64,
    /// Reads that had to recompute.
    pub misses: u64,
    /// Reads that ran uncached because the backend failed.
    pub bypasses: u64,
    /// Results written to the cache.
    pub stores: u64,
    /// Misses that gave up waiting on another recompute.
    pub lock_timeouts: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared atomic counters behind [`CacheStats`].
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    stores: AtomicU64,
    lock_timeouts: AtomicU64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
        }
    }
}
