//! Entry point tying configuration, stores and counters together.

use std::sync::Arc;

use querycache_core::{QueryCacheConfig, QueryCacheResult, Tag};

use super::proxy::{CacheOptions, QueryCacheProxy};
use super::registry::StoreRegistry;
use super::source::DataSource;
use super::tag_versions::TagVersionStore;
use super::traits::{unsupported, CacheCounters, CacheStats, CacheStore};

struct QueryCacheInner {
    config: QueryCacheConfig,
    registry: StoreRegistry,
    counters: Arc<CacheCounters>,
}

/// The query cache. Cheap to clone; clones share stores and counters.
///
/// # Example
///
/// ```ignore
/// let cache = QueryCache::new(config, StoreRegistry::single("memory", store))?;
/// let conn = cache.connection(db, CacheOptions::new().tag("posts"))?;
/// let rows = conn.select("select * from posts", &[]).await?;
/// cache.forget(&["posts"]).await?;
/// ```
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<QueryCacheInner>,
}

impl QueryCache {
    /// Build the cache, rejecting configurations the default store cannot
    /// honour. Nothing is checked against stores when caching is disabled.
    pub fn new(config: QueryCacheConfig, registry: StoreRegistry) -> QueryCacheResult<Self> {
        config.validate()?;
        if config.enable {
            let (_, store) = registry.resolve(config.store.as_deref())?;
            require_locking(store.as_ref(), config.lock_wait())?;
        }

        tracing::debug!(
            enabled = config.enable,
            store = ?config.store,
            prefix = %config.prefix,
            "Query cache configured"
        );
        Ok(Self {
            inner: Arc::new(QueryCacheInner {
                config,
                registry,
                counters: Arc::new(CacheCounters::new()),
            }),
        })
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enable
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.inner.registry
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot()
    }

    /// Tag versions kept in the named store, or the default one.
    pub fn tag_versions(&self, store: Option<&str>) -> QueryCacheResult<TagVersionStore> {
        let store = store.or(self.inner.config.store.as_deref());
        let (_, store) = self.inner.registry.resolve(store)?;
        Ok(TagVersionStore::new(store, self.inner.config.prefix.clone()))
    }

    /// Build a caching proxy around `source`, whether or not caching is
    /// enabled.
    pub fn proxy(
        &self,
        source: Arc<dyn DataSource>,
        options: CacheOptions,
    ) -> QueryCacheResult<QueryCacheProxy> {
        let tags = options.effective_tags()?;
        let wait = options.wait.unwrap_or_else(|| self.inner.config.lock_wait());
        let ttl = options
            .ttl
            .unwrap_or_else(|| self.inner.config.ttl().into());

        let versions = self.tag_versions(options.store.as_deref())?;
        require_locking(versions.store().as_ref(), wait)?;

        Ok(QueryCacheProxy::new(source, versions, tags, ttl, wait)
            .with_counters(Arc::clone(&self.inner.counters)))
    }

    /// A connection that caches reads of `source`.
    ///
    /// With caching disabled `source` comes back untouched.
    pub fn connection(
        &self,
        source: Arc<dyn DataSource>,
        options: CacheOptions,
    ) -> QueryCacheResult<Arc<dyn DataSource>> {
        if !self.is_enabled() {
            return Ok(source);
        }
        Ok(Arc::new(self.proxy(source, options)?))
    }

    /// Invalidate every entry carrying any of `tags` in the default store.
    pub async fn forget<S: AsRef<str>>(&self, tags: &[S]) -> QueryCacheResult<u64> {
        self.forget_in(None, tags).await
    }

    /// Invalidate every entry carrying any of `tags` in the named store.
    ///
    /// Returns the number of entries purged, which is zero for stores
    /// without tag sets even though the entries are unreachable.
    pub async fn forget_in<S: AsRef<str>>(
        &self,
        store: Option<&str>,
        tags: &[S],
    ) -> QueryCacheResult<u64> {
        let tags = Tag::parse_all(tags.iter().map(|t| t.as_ref().to_string()))?;
        let versions = self.tag_versions(store)?;
        let purged = versions.forget(&tags).await?;
        tracing::info!(
            store = versions.store().name(),
            tags = ?tags.iter().map(Tag::as_str).collect::<Vec<_>>(),
            purged,
            "Forgot query cache tags"
        );
        Ok(purged)
    }

    /// Keys registered under the current version of `tag`.
    pub async fn tagged_entries(&self, tag: &str) -> QueryCacheResult<Vec<String>> {
        let tag = Tag::new(tag)?;
        self.tag_versions(None)?.entries(&tag).await
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

fn require_locking(store: &dyn CacheStore, wait: std::time::Duration) -> QueryCacheResult<()> {
    if !wait.is_zero() && !store.supports_locking() {
        return Err(unsupported(store.name(), "atomic locks"));
    }
    Ok(())
}
