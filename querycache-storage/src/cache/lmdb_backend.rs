//! LMDB-backed cache store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a persistent,
//! memory-mapped key-value store that several processes on one host can
//! share.
//!
//! # Value Format
//!
//! `[expires_at_millis: 8 bytes LE][payload]`, where `expires_at_millis == 0`
//! means no expiry. Expired values are treated as absent and removed lazily.
//!
//! # Capabilities
//!
//! LMDB write transactions are serialized, which gives atomic `add`, named
//! locks (`locks` database, owner token + lease) and tag sets (`tags`
//! database keyed by `tag_key \0 entry_key`).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use querycache_core::{BackendError, QueryCacheError, QueryCacheResult};

use super::traits::{CacheStore, LockHandle};

const NO_EXPIRY: i64 = 0;
const TAG_SEPARATOR: u8 = 0x00;
const LOCK_POLL: Duration = Duration::from_millis(25);

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for QueryCacheError {
    fn from(e: LmdbCacheError) -> Self {
        BackendError::Unavailable {
            store: "lmdb".to_string(),
            reason: e.to_string(),
        }
        .into()
    }
}

fn txn_err(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Option<Duration>) -> i64 {
    match ttl {
        Some(ttl) => now_millis().saturating_add(ttl.as_millis() as i64).max(1),
        None => NO_EXPIRY,
    }
}

fn is_live(expires_at: i64, now: i64) -> bool {
    expires_at == NO_EXPIRY || expires_at > now
}

fn encode_value(expires_at: i64, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + payload.len());
    bytes.extend_from_slice(&expires_at.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Split a stored value into expiry and payload. Short values are corrupt
/// and reported as `None`.
fn decode_value(bytes: &[u8]) -> Option<(i64, &[u8])> {
    let header: [u8; 8] = bytes.get(0..8)?.try_into().ok()?;
    Some((i64::from_le_bytes(header), &bytes[8..]))
}

fn tag_member_key(tag_key: &str, entry_key: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tag_key.len() + 1 + entry_key.len());
    key.extend_from_slice(tag_key.as_bytes());
    key.push(TAG_SEPARATOR);
    key.extend_from_slice(entry_key.as_bytes());
    key
}

fn tag_prefix(tag_key: &str) -> Vec<u8> {
    let mut prefix = tag_key.as_bytes().to_vec();
    prefix.push(TAG_SEPARATOR);
    prefix
}

/// LMDB-backed cache store.
///
/// # Example
///
/// ```ignore
/// let store = LmdbCacheStore::open("/var/cache/query-cache", 256)?;
/// let registry = StoreRegistry::new().with_store("lmdb", Arc::new(store));
/// ```
pub struct LmdbCacheStore {
    name: String,
    env: Env,
    values: Database<Bytes, Bytes>,
    tags: Database<Bytes, Bytes>,
    locks: Database<Bytes, Bytes>,
    next_owner: AtomicU64,
}

impl LmdbCacheStore {
    /// Open (or create) a store in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Databases cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per store and the path is
        // not reopened with different flags inside this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(3)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let values: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("values"))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        let tags: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("tags"))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        let locks: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("locks"))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            name: "lmdb".to_string(),
            env,
            values,
            tags,
            locks,
            next_owner: AtomicU64::new(1),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Lock owners must be unique across processes sharing the file, so the
    /// token mixes the process id, a clock reading and a local counter.
    fn owner_token(&self) -> Vec<u8> {
        let local = self.next_owner.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}", std::process::id(), now_millis(), local).into_bytes()
    }

    fn try_lock(&self, name: &str, owner: &[u8], lease: Duration) -> Result<bool, LmdbCacheError> {
        let now = now_millis();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let held = match self.locks.get(&wtxn, name.as_bytes()).map_err(txn_err)? {
            Some(bytes) => decode_value(bytes).is_some_and(|(expires_at, _)| is_live(expires_at, now)),
            None => false,
        };
        if held {
            wtxn.abort();
            return Ok(false);
        }
        let record = encode_value(expiry_millis(Some(lease)), owner);
        self.locks
            .put(&mut wtxn, name.as_bytes(), &record)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    /// Delete member keys of a tag set along with the set. Returns the
    /// number of values removed.
    fn flush_tag_sync(&self, tag_key: &str) -> Result<u64, LmdbCacheError> {
        let prefix = tag_prefix(tag_key);
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let members: Vec<Vec<u8>> = {
            let iter = self.tags.iter(&wtxn).map_err(txn_err)?;
            iter.filter_map(Result::ok)
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.to_vec())
                .collect()
        };

        let mut removed = 0u64;
        for member in &members {
            let entry_key = &member[prefix.len()..];
            if self.values.delete(&mut wtxn, entry_key).map_err(txn_err)? {
                removed += 1;
            }
            self.tags.delete(&mut wtxn, member).map_err(txn_err)?;
        }

        wtxn.commit().map_err(txn_err)?;
        Ok(removed)
    }
}

/// Lock handle issued by [`LmdbCacheStore`]. Releases on drop.
pub struct LmdbLock {
    name: String,
    owner: Vec<u8>,
    env: Env,
    locks: Database<Bytes, Bytes>,
    released: bool,
}

impl LmdbLock {
    fn release_sync(&self) -> Result<(), LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let owned = match self.locks.get(&wtxn, self.name.as_bytes()).map_err(txn_err)? {
            Some(bytes) => decode_value(bytes).is_some_and(|(_, owner)| owner == self.owner.as_slice()),
            None => false,
        };
        if owned {
            self.locks
                .delete(&mut wtxn, self.name.as_bytes())
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }
}

impl LockHandle for LmdbLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.release_sync() {
            // The lease still bounds how long the lock can linger.
            tracing::warn!(lock = %self.name, error = %e, "Failed to release LMDB lock");
        }
    }
}

impl Drop for LmdbLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl CacheStore for LmdbCacheStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> QueryCacheResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let Some(bytes) = self.values.get(&rtxn, key.as_bytes()).map_err(txn_err)? else {
            return Ok(None);
        };

        match decode_value(bytes) {
            Some((expires_at, payload)) if is_live(expires_at, now_millis()) => {
                Ok(Some(payload.to_vec()))
            }
            Some(_) => Ok(None),
            None => Err(BackendError::CorruptEntry {
                key: key.to_string(),
                reason: "value shorter than header".to_string(),
            }
            .into()),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> QueryCacheResult<()> {
        let bytes = encode_value(expiry_millis(ttl), &value);
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.values
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> QueryCacheResult<bool> {
        let now = now_millis();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let live = match self.values.get(&wtxn, key.as_bytes()).map_err(txn_err)? {
            Some(bytes) => decode_value(bytes).is_some_and(|(expires_at, _)| is_live(expires_at, now)),
            None => false,
        };
        if live {
            wtxn.abort();
            return Ok(false);
        }
        let bytes = encode_value(expiry_millis(ttl), &value);
        self.values
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    async fn put_many(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> QueryCacheResult<()> {
        let expires_at = expiry_millis(ttl);
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        for (key, value) in &entries {
            self.values
                .put(&mut wtxn, key.as_bytes(), &encode_value(expires_at, value))
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn forget(&self, key: &str) -> QueryCacheResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self
            .values
            .delete(&mut wtxn, key.as_bytes())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    fn supports_locking(&self) -> bool {
        true
    }

    async fn lock(
        &self,
        name: &str,
        lease: Duration,
        wait: Duration,
    ) -> QueryCacheResult<Box<dyn LockHandle>> {
        let owner = self.owner_token();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if self.try_lock(name, &owner, lease)? {
                return Ok(Box::new(LmdbLock {
                    name: name.to_string(),
                    owner,
                    env: self.env.clone(),
                    locks: self.locks,
                    released: false,
                }));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(BackendError::LockTimeout {
                    key: name.to_string(),
                    waited: wait,
                }
                .into());
            }
            // Other processes cannot notify us, so poll.
            tokio::time::sleep(LOCK_POLL.min(deadline - now)).await;
        }
    }

    fn supports_tagging(&self) -> bool {
        true
    }

    async fn add_tag_entry(
        &self,
        tag_key: &str,
        entry_key: &str,
        ttl: Duration,
    ) -> QueryCacheResult<()> {
        let member = tag_member_key(tag_key, entry_key);
        let now = now_millis();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let exists = match self.tags.get(&wtxn, &member).map_err(txn_err)? {
            Some(bytes) => decode_value(bytes).is_some_and(|(expires_at, _)| is_live(expires_at, now)),
            None => false,
        };
        if !exists {
            self.tags
                .put(&mut wtxn, &member, &encode_value(expiry_millis(Some(ttl)), &[]))
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn tag_entries(&self, tag_key: &str) -> QueryCacheResult<Vec<String>> {
        let prefix = tag_prefix(tag_key);
        let now = now_millis();
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let iter = self.tags.iter(&rtxn).map_err(txn_err)?;

        let mut entries: Vec<String> = iter
            .filter_map(Result::ok)
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter(|(_, value)| {
                decode_value(value).is_some_and(|(expires_at, _)| is_live(expires_at, now))
            })
            .map(|(key, _)| String::from_utf8_lossy(&key[prefix.len()..]).into_owned())
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn flush_tag(&self, tag_key: &str) -> QueryCacheResult<u64> {
        Ok(self.flush_tag_sync(tag_key)?)
    }
}
