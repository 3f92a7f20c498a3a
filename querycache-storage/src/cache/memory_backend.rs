//! In-process cache store.
//!
//! Supports both optional capabilities: named locks with a lease, and tag
//! sets. Expiry is measured on the tokio clock so tests can drive it with
//! `tokio::time::pause` / `advance`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use querycache_core::{BackendError, CacheEntry, QueryCacheError, QueryCacheResult};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use super::traits::{CacheStore, LockHandle};

/// Minimum time between two sweeps of expired values and tag members.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct StoredValue {
    entry: CacheEntry,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
struct LockLease {
    owner: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LockTable {
    leases: Mutex<HashMap<String, LockLease>>,
    released: Notify,
}

impl LockTable {
    /// Try to take the lock. On failure returns how long the current lease
    /// still runs.
    fn try_acquire(&self, name: &str, owner: u64, lease: Duration) -> Result<(), Duration> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get(name) {
            Some(current) if current.expires_at > now => Err(current.expires_at - now),
            _ => {
                leases.insert(
                    name.to_string(),
                    LockLease {
                        owner,
                        expires_at: now + lease,
                    },
                );
                Ok(())
            }
        }
    }

    fn release(&self, name: &str, owner: u64) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.get(name).is_some_and(|l| l.owner == owner) {
            leases.remove(name);
        }
        drop(leases);
        self.released.notify_waiters();
    }
}

/// Lock handle issued by [`InMemoryCacheStore`]. Releases on drop.
#[derive(Debug)]
pub struct MemoryLock {
    name: String,
    owner: u64,
    table: Arc<LockTable>,
    released: bool,
}

impl LockHandle for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.table.release(&self.name, self.owner);
        }
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// In-memory cache store for a single process, and for tests.
///
/// Uses tokio::sync::RwLock for values and tag sets; the lock table uses a
/// plain mutex because it must be released from `Drop`.
///
/// Expired values and tag members are dropped by a sweep that runs on
/// writes, at most once per [`SWEEP_INTERVAL`].
#[derive(Debug)]
pub struct InMemoryCacheStore {
    name: String,
    values: RwLock<HashMap<String, StoredValue>>,
    tag_sets: RwLock<HashMap<String, HashMap<String, Instant>>>,
    locks: Arc<LockTable>,
    last_sweep: Mutex<Instant>,
    next_owner: AtomicU64,
    outage: AtomicBool,
    locking: bool,
    tagging: bool,
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryCacheStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: RwLock::new(HashMap::new()),
            tag_sets: RwLock::new(HashMap::new()),
            locks: Arc::new(LockTable::default()),
            last_sweep: Mutex::new(Instant::now()),
            next_owner: AtomicU64::new(1),
            outage: AtomicBool::new(false),
            locking: true,
            tagging: true,
        }
    }

    /// Advertise (or hide) the locking capability.
    pub fn with_locking(mut self, enabled: bool) -> Self {
        self.locking = enabled;
        self
    }

    /// Advertise (or hide) the tagging capability.
    pub fn with_tagging(mut self, enabled: bool) -> Self {
        self.tagging = enabled;
        self
    }

    /// Make every operation fail with `Unavailable` until switched off.
    pub fn simulate_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Number of live values.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.values
            .read()
            .await
            .values()
            .filter(|v| v.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Full entry for a key, including creation time and TTL.
    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        self.values
            .read()
            .await
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.entry.clone())
    }

    fn check_available(&self) -> QueryCacheResult<()> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(QueryCacheError::unavailable(
                self.name.as_str(),
                "simulated outage",
            ));
        }
        Ok(())
    }

    /// Drop expired values, expired tag members and emptied tag sets.
    async fn sweep_expired(&self) {
        let now = Instant::now();
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
            if now.duration_since(*last) < SWEEP_INTERVAL {
                return;
            }
            *last = now;
        }

        let mut values = self.values.write().await;
        let before = values.len();
        values.retain(|_, v| v.is_live(now));
        let swept = before - values.len();
        drop(values);

        let mut tag_sets = self.tag_sets.write().await;
        for members in tag_sets.values_mut() {
            members.retain(|_, expires_at| *expires_at > now);
        }
        tag_sets.retain(|_, members| !members.is_empty());

        if swept > 0 {
            tracing::trace!(store = %self.name, swept, "Swept expired cache values");
        }
    }

    fn stored(key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoredValue {
        StoredValue {
            entry: CacheEntry::new(key, value, ttl),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> QueryCacheResult<Option<Vec<u8>>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .values
            .read()
            .await
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.entry.payload.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> QueryCacheResult<()> {
        self.check_available()?;
        self.sweep_expired().await;
        self.values
            .write()
            .await
            .insert(key.to_string(), Self::stored(key, value, ttl));
        Ok(())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> QueryCacheResult<bool> {
        self.check_available()?;
        self.sweep_expired().await;
        let now = Instant::now();
        let mut values = self.values.write().await;
        if values.get(key).is_some_and(|v| v.is_live(now)) {
            return Ok(false);
        }
        values.insert(key.to_string(), Self::stored(key, value, ttl));
        Ok(true)
    }

    async fn put_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> QueryCacheResult<()> {
        self.check_available()?;
        self.sweep_expired().await;
        let mut values = self.values.write().await;
        for (key, value) in entries {
            let stored = Self::stored(&key, value, ttl);
            values.insert(key, stored);
        }
        Ok(())
    }

    async fn forget(&self, key: &str) -> QueryCacheResult<bool> {
        self.check_available()?;
        Ok(self.values.write().await.remove(key).is_some())
    }

    fn supports_locking(&self) -> bool {
        self.locking
    }

    async fn lock(
        &self,
        name: &str,
        lease: Duration,
        wait: Duration,
    ) -> QueryCacheResult<Box<dyn LockHandle>> {
        if !self.locking {
            return Err(super::traits::unsupported(&self.name, "atomic locks"));
        }
        self.check_available()?;

        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a release between the
            // check and the wait is not missed.
            let notified = self.locks.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let lease_left = match self.locks.try_acquire(name, owner, lease) {
                Ok(()) => {
                    return Ok(Box::new(MemoryLock {
                        name: name.to_string(),
                        owner,
                        table: Arc::clone(&self.locks),
                        released: false,
                    }));
                }
                Err(lease_left) => lease_left,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(BackendError::LockTimeout {
                    key: name.to_string(),
                    waited: wait,
                }
                .into());
            }

            let nap = (deadline - now).min(lease_left);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    fn supports_tagging(&self) -> bool {
        self.tagging
    }

    async fn add_tag_entry(
        &self,
        tag_key: &str,
        entry_key: &str,
        ttl: Duration,
    ) -> QueryCacheResult<()> {
        if !self.tagging {
            return Err(super::traits::unsupported(&self.name, "tagging"));
        }
        self.check_available()?;
        self.sweep_expired().await;
        let expires_at = Instant::now() + ttl;
        self.tag_sets
            .write()
            .await
            .entry(tag_key.to_string())
            .or_default()
            .entry(entry_key.to_string())
            .or_insert(expires_at);
        Ok(())
    }

    async fn tag_entries(&self, tag_key: &str) -> QueryCacheResult<Vec<String>> {
        if !self.tagging {
            return Err(super::traits::unsupported(&self.name, "tagging"));
        }
        self.check_available()?;
        let now = Instant::now();
        let mut entries: Vec<String> = self
            .tag_sets
            .read()
            .await
            .get(tag_key)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default();
        entries.sort();
        Ok(entries)
    }

    async fn flush_tag(&self, tag_key: &str) -> QueryCacheResult<u64> {
        if !self.tagging {
            return Err(super::traits::unsupported(&self.name, "tagging"));
        }
        self.check_available()?;
        let members = self.tag_sets.write().await.remove(tag_key);
        let Some(members) = members else {
            return Ok(0);
        };

        let mut values = self.values.write().await;
        let removed = members
            .keys()
            .filter(|key| values.remove(key.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }
}
