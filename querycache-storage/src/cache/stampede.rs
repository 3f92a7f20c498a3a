//! Stampede protection for cache misses.
//!
//! When many callers miss on the same key at once, only the one holding the
//! key's lock recomputes; the rest wait for the lock, then re-check the
//! cache and usually find the fresh entry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use querycache_core::{CacheKey, QueryCacheResult};

use super::traits::{CacheStore, LockHandle};

/// How the guard behaves around the guarded computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingMode {
    /// Serialize computations per key through the store's locks.
    Blocking,
    /// Run computations unguarded.
    PassThrough,
}

/// Serializes recomputation of the same key across tasks and processes.
#[derive(Clone)]
pub struct StampedeGuard {
    store: Option<Arc<dyn CacheStore>>,
    mode: LockingMode,
}

impl StampedeGuard {
    /// Guard backed by `store`'s locks.
    ///
    /// A store without locking yields a pass-through guard. Callers that
    /// require locking must reject such stores before getting here.
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        if store.supports_locking() {
            Self {
                store: Some(store),
                mode: LockingMode::Blocking,
            }
        } else {
            tracing::warn!(
                store = store.name(),
                "Cache store has no atomic locks, stampede protection disabled"
            );
            Self::pass_through()
        }
    }

    /// Guard that never locks.
    pub fn pass_through() -> Self {
        Self {
            store: None,
            mode: LockingMode::PassThrough,
        }
    }

    pub fn mode(&self) -> LockingMode {
        self.mode
    }

    fn lock_name(key: &CacheKey) -> String {
        format!("{}:lock", key)
    }

    /// Acquire the lock for `key`, waiting at most `wait`.
    ///
    /// Returns `None` when no lock is taken (zero wait or pass-through).
    /// The lease matches `wait`, so a crashed holder blocks others for no
    /// longer than they would wait anyway.
    pub async fn acquire(&self, key: &CacheKey, wait: Duration) -> QueryCacheResult<Option<HeldLock>> {
        let store = match (&self.store, self.mode) {
            (Some(store), LockingMode::Blocking) if !wait.is_zero() => store,
            _ => return Ok(None),
        };

        let handle = store.lock(&Self::lock_name(key), wait, wait).await?;
        tracing::trace!(key = %key, "Acquired recompute lock");
        Ok(Some(HeldLock { handle }))
    }

    /// Run `compute` while holding the lock for `key`.
    ///
    /// The lock is released when `compute` finishes, fails, or the returned
    /// future is dropped. A lock timeout is returned as an error and
    /// `compute` is not run.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &CacheKey,
        wait: Duration,
        compute: F,
    ) -> QueryCacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = QueryCacheResult<T>>,
    {
        let _held = self.acquire(key, wait).await?;
        compute().await
    }
}

impl std::fmt::Debug for StampedeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StampedeGuard")
            .field("store", &self.store.as_ref().map(|s| s.name().to_string()))
            .field("mode", &self.mode)
            .finish()
    }
}

/// A lock taken by [`StampedeGuard::acquire`]. Released on drop.
pub struct HeldLock {
    handle: Box<dyn LockHandle>,
}

impl HeldLock {
    pub fn release(mut self) {
        self.handle.release();
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.handle.release();
    }
}
