//! Read-through caching proxy for a data source.
//!
//! A read goes through key resolution, a fast lookup, and on a miss a
//! guarded recompute that re-checks the cache, runs the query, and stores
//! the result. Transient backend failures turn the read into a plain
//! uncached call; they never reach the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use querycache_core::{
    CacheKey, CacheKeyDeriver, InputError, QueryCacheError, QueryCacheResult, ResultSet, Tag,
    TagSet, TagVersion, Ttl,
};
use serde_json::Value;
use std::collections::BTreeMap;

use super::source::{unwrap_source, DataSource};
use super::stampede::StampedeGuard;
use super::tag_versions::TagVersionStore;
use super::traits::CacheCounters;

/// Tables a relation load touches, contributed to the tag set of every
/// query run for that relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationContext {
    /// Table of the related records.
    pub related: String,
    /// Table of the records the relation is loaded for.
    pub parent: String,
    /// Set for relations reached through an intermediate table.
    pub through: Option<ThroughContext>,
}

/// Both ends of the intermediate hop of a through relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughContext {
    /// Table of the intermediate records.
    pub through_parent: String,
    /// Table of the far records.
    pub far_parent: String,
}

impl RelationContext {
    pub fn new(related: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            related: related.into(),
            parent: parent.into(),
            through: None,
        }
    }

    pub fn with_through(
        mut self,
        through_parent: impl Into<String>,
        far_parent: impl Into<String>,
    ) -> Self {
        self.through = Some(ThroughContext {
            through_parent: through_parent.into(),
            far_parent: far_parent.into(),
        });
        self
    }

    /// Table names contributed as tags, in order.
    pub fn tag_names(&self) -> Vec<&str> {
        let mut names = vec![self.related.as_str(), self.parent.as_str()];
        if let Some(through) = &self.through {
            names.push(through.through_parent.as_str());
            names.push(through.far_parent.as_str());
        }
        names
    }
}

/// Per-connection caching options. Unset fields fall back to configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheOptions {
    pub ttl: Option<Ttl>,
    pub tags: Vec<String>,
    pub store: Option<String>,
    pub wait: Option<Duration>,
    pub relation: Option<RelationContext>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn store(mut self, store: impl Into<String>) -> Self {
        self.store = Some(store.into());
        self
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn relation(mut self, relation: RelationContext) -> Self {
        self.relation = Some(relation);
        self
    }

    /// Caller tags followed by relation tags, deduplicated in first-seen
    /// order.
    ///
    /// Fails with `MissingTags` when nothing is left, and with `InvalidTag`
    /// for blank tags.
    pub fn effective_tags(&self) -> QueryCacheResult<TagSet> {
        let mut tags = TagSet::new();
        for raw in &self.tags {
            tags.insert(Tag::new(raw.as_str())?);
        }
        if let Some(relation) = &self.relation {
            for name in relation.tag_names() {
                tags.insert(Tag::new(name)?);
            }
        }
        if tags.is_empty() {
            return Err(InputError::MissingTags.into());
        }
        Ok(tags)
    }
}

/// How a read was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the cache.
    Hit,
    /// Recomputed and, TTL permitting, stored.
    Miss,
    /// Run uncached because the backend failed.
    Bypass,
}

/// A value together with how it was obtained.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    outcome: CacheOutcome,
    key: Option<CacheKey>,
}

impl<T> CacheRead<T> {
    fn new(value: T, outcome: CacheOutcome, key: Option<CacheKey>) -> Self {
        Self {
            value,
            outcome,
            key,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn outcome(&self) -> CacheOutcome {
        self.outcome
    }

    pub fn is_hit(&self) -> bool {
        self.outcome == CacheOutcome::Hit
    }

    /// The cache key, absent for bypassed reads.
    pub fn key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }
}

/// A [`DataSource`] that caches every read of the source it wraps.
pub struct QueryCacheProxy {
    inner: Arc<dyn DataSource>,
    versions: TagVersionStore,
    guard: StampedeGuard,
    tags: Vec<Tag>,
    ttl: Ttl,
    wait: Duration,
    counters: Arc<CacheCounters>,
}

impl QueryCacheProxy {
    /// Wrap `inner`. Proxy layers already around `inner` are stripped first.
    ///
    /// A zero `wait` disables locking. A non-zero `wait` on a store without
    /// locks gives a pass-through guard; the facade rejects that
    /// combination before it gets here.
    pub fn new(
        inner: Arc<dyn DataSource>,
        versions: TagVersionStore,
        tags: TagSet,
        ttl: Ttl,
        wait: Duration,
    ) -> Self {
        let guard = if wait.is_zero() {
            StampedeGuard::pass_through()
        } else {
            StampedeGuard::new(Arc::clone(versions.store()))
        };
        Self {
            inner: unwrap_source(inner),
            versions,
            guard,
            tags: tags.into_vec(),
            ttl,
            wait,
            counters: Arc::new(CacheCounters::new()),
        }
    }

    /// Report into shared counters instead of private ones.
    pub fn with_counters(mut self, counters: Arc<CacheCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn counters(&self) -> &Arc<CacheCounters> {
        &self.counters
    }

    /// Run a read through the cache and report how it was answered.
    pub async fn select_with_outcome(
        &self,
        query: &str,
        bindings: &[Value],
    ) -> QueryCacheResult<CacheRead<ResultSet>> {
        let fingerprint = CacheKeyDeriver::derive(self.inner.identity(), query, bindings)?;

        let versions = match self.versions.resolve_versions(&self.tags).await {
            Ok(versions) => versions,
            Err(e) if e.is_transient() => return self.bypass(query, bindings, &e).await,
            Err(e) => return Err(e),
        };
        let key = self.versions.compose_with(&fingerprint, &versions);

        match self.lookup(&key).await {
            Ok(Some(rows)) => {
                self.counters.record_hit();
                tracing::trace!(key = %key, "Query cache hit");
                return Ok(CacheRead::new(rows, CacheOutcome::Hit, Some(key)));
            }
            Ok(None) => {}
            Err(e) if e.is_transient() => return self.bypass(query, bindings, &e).await,
            Err(e) => return Err(e),
        }

        let held = match self.guard.acquire(&key, self.wait).await {
            Ok(held) => held,
            Err(e) if e.is_lock_timeout() => {
                self.counters.record_lock_timeout();
                tracing::debug!(key = %key, "Gave up waiting for recompute lock");
                return Err(e);
            }
            Err(e) if e.is_transient() => return self.bypass(query, bindings, &e).await,
            Err(e) => return Err(e),
        };

        if held.is_some() {
            // Another holder may have stored the result while we waited.
            if let Ok(Some(rows)) = self.lookup(&key).await {
                self.counters.record_hit();
                return Ok(CacheRead::new(rows, CacheOutcome::Hit, Some(key)));
            }
        }

        self.counters.record_miss();
        let rows = self.inner.select(query, bindings).await?;
        self.store_result(&key, &versions, &rows).await;
        drop(held);

        Ok(CacheRead::new(rows, CacheOutcome::Miss, Some(key)))
    }

    async fn lookup(&self, key: &CacheKey) -> QueryCacheResult<Option<ResultSet>> {
        let Some(bytes) = self.versions.store().get(key.as_str()).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(rows) => Ok(Some(rows)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    /// Write the result and register it under its tags. Failures only cost
    /// a future miss, so they are logged and swallowed.
    async fn store_result(
        &self,
        key: &CacheKey,
        versions: &BTreeMap<Tag, TagVersion>,
        rows: &ResultSet,
    ) {
        let secs = self.ttl.as_secs_at(Utc::now());
        if secs == 0 {
            return;
        }
        let ttl = Duration::from_secs(secs);

        let bytes = match serde_json::to_vec(rows) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Result set not serializable, not caching");
                return;
            }
        };

        let store = self.versions.store();
        if let Err(e) = store.put(key.as_str(), bytes, Some(ttl)).await {
            tracing::warn!(key = %key, store = store.name(), error = %e, "Failed to store query result");
            return;
        }
        self.counters.record_store();

        if store.supports_tagging() {
            if let Err(e) = self.versions.register(key, versions, ttl).await {
                tracing::warn!(key = %key, error = %e, "Failed to register cache entry under its tags");
            }
        }
    }

    async fn bypass(
        &self,
        query: &str,
        bindings: &[Value],
        cause: &QueryCacheError,
    ) -> QueryCacheResult<CacheRead<ResultSet>> {
        tracing::warn!(
            store = self.versions.store().name(),
            error = %cause,
            "Cache backend failed, running query uncached"
        );
        self.counters.record_bypass();
        let rows = self.inner.select(query, bindings).await?;
        Ok(CacheRead::new(rows, CacheOutcome::Bypass, None))
    }
}

#[async_trait]
impl DataSource for QueryCacheProxy {
    fn identity(&self) -> &str {
        self.inner.identity()
    }

    async fn select(&self, query: &str, bindings: &[Value]) -> QueryCacheResult<ResultSet> {
        Ok(self.select_with_outcome(query, bindings).await?.into_value())
    }

    async fn statement(&self, query: &str, bindings: &[Value]) -> QueryCacheResult<u64> {
        self.inner.statement(query, bindings).await
    }

    fn inner_source(&self) -> Option<Arc<dyn DataSource>> {
        Some(Arc::clone(&self.inner))
    }
}

impl std::fmt::Debug for QueryCacheProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCacheProxy")
            .field("source", &self.inner.identity())
            .field("versions", &self.versions)
            .field("tags", &self.tags)
            .field("ttl", &self.ttl)
            .field("wait", &self.wait)
            .finish()
    }
}
