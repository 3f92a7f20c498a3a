//! Tag versions for O(1) bulk invalidation.
//!
//! Every tag has a current version token stored under
//! `{prefix}:tag:{slot}:version`, where the slot is the tag or its
//! digest (see [`Tag::slot`]). Cache keys fold in the versions of all
//! their tags, so bumping a tag makes every key composed with the old
//! version unreachable without touching any entry.
//!
//! Versions never expire. If a backend evicts one anyway, the next read
//! creates a fresh token, which is just an early invalidation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use querycache_core::{
    compose_key, BackendError, CacheKey, QueryCacheError, QueryCacheResult, QueryFingerprint, Tag,
    TagVersion,
};

use super::traits::CacheStore;

/// Attempts at get-or-create before reporting the backend as unavailable.
const CREATE_ATTEMPTS: usize = 3;

/// Maintains the current version of each tag in a [`CacheStore`].
#[derive(Clone)]
pub struct TagVersionStore {
    store: Arc<dyn CacheStore>,
    prefix: String,
}

impl TagVersionStore {
    pub fn new(store: Arc<dyn CacheStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    fn version_key(&self, tag: &Tag) -> String {
        format!("{}:tag:{}:version", self.prefix, tag.slot())
    }

    /// Key of the set of entries registered under one version of a tag.
    pub fn tag_set_key(&self, tag: &Tag, version: &TagVersion) -> String {
        format!("{}:tag:{}:{}:entries", self.prefix, tag.slot(), version)
    }

    async fn read_version(&self, tag: &Tag) -> QueryCacheResult<Option<TagVersion>> {
        let key = self.version_key(tag);
        match self.store.get(&key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(|raw| Some(TagVersion::from_raw(raw)))
                .map_err(|e| {
                    BackendError::CorruptEntry {
                        key,
                        reason: e.to_string(),
                    }
                    .into()
                }),
            None => Ok(None),
        }
    }

    /// Current version of one tag, creating it if the tag was never seen.
    ///
    /// Creation goes through the store's atomic `add`, so concurrent
    /// creators all settle on the single winning token.
    pub async fn current_version(&self, tag: &Tag) -> QueryCacheResult<TagVersion> {
        for _ in 0..CREATE_ATTEMPTS {
            if let Some(version) = self.read_version(tag).await? {
                return Ok(version);
            }

            let candidate = TagVersion::generate();
            let created = self
                .store
                .add(
                    &self.version_key(tag),
                    candidate.as_str().as_bytes().to_vec(),
                    None,
                )
                .await?;
            if created {
                tracing::trace!(tag = %tag, version = %candidate, "Created tag version");
                return Ok(candidate);
            }
        }

        Err(QueryCacheError::unavailable(
            self.store.name(),
            format!("could not settle a version for tag {tag}"),
        ))
    }

    /// Current versions of every tag, keyed by tag.
    pub async fn resolve_versions(&self, tags: &[Tag]) -> QueryCacheResult<BTreeMap<Tag, TagVersion>> {
        let mut versions = BTreeMap::new();
        for tag in tags {
            if versions.contains_key(tag) {
                continue;
            }
            let version = self.current_version(tag).await?;
            versions.insert(tag.clone(), version);
        }
        Ok(versions)
    }

    /// Combine a fingerprint with already-resolved versions.
    pub fn compose_with(
        &self,
        fingerprint: &QueryFingerprint,
        versions: &BTreeMap<Tag, TagVersion>,
    ) -> CacheKey {
        compose_key(&self.prefix, fingerprint, versions)
    }

    /// Resolve the current versions of `tags` and compose the cache key.
    pub async fn compose_key(
        &self,
        fingerprint: &QueryFingerprint,
        tags: &[Tag],
    ) -> QueryCacheResult<CacheKey> {
        let versions = self.resolve_versions(tags).await?;
        Ok(self.compose_with(fingerprint, &versions))
    }

    /// Assign every tag a fresh version in one store write.
    ///
    /// Returns the superseded versions (`None` for tags that had none).
    /// Cost is proportional to the number of tags, never to the number of
    /// cached entries.
    pub async fn bump(&self, tags: &[Tag]) -> QueryCacheResult<BTreeMap<Tag, Option<TagVersion>>> {
        let mut previous = BTreeMap::new();
        for tag in tags {
            if previous.contains_key(tag) {
                continue;
            }
            // Reading the old version only serves purging; a failed read
            // must not stop the bump.
            let old = self.read_version(tag).await.unwrap_or(None);
            previous.insert(tag.clone(), old);
        }

        let writes = previous
            .keys()
            .map(|tag| {
                (
                    self.version_key(tag),
                    TagVersion::generate().as_str().as_bytes().to_vec(),
                )
            })
            .collect();
        self.store.put_many(writes, None).await?;

        tracing::debug!(
            store = self.store.name(),
            tags = ?previous.keys().map(Tag::as_str).collect::<Vec<_>>(),
            "Bumped tag versions"
        );
        Ok(previous)
    }

    /// Bump `tags` and, when the store keeps tag sets, delete the entries
    /// registered under the superseded versions.
    ///
    /// Purging only reclaims space early; a purge failure is logged and the
    /// call still succeeds because the bump alone already invalidated.
    pub async fn forget(&self, tags: &[Tag]) -> QueryCacheResult<u64> {
        let previous = self.bump(tags).await?;
        if !self.store.supports_tagging() {
            return Ok(0);
        }

        let mut purged = 0;
        for (tag, version) in &previous {
            let Some(version) = version else { continue };
            match self.store.flush_tag(&self.tag_set_key(tag, version)).await {
                Ok(count) => purged += count,
                Err(e) => {
                    tracing::warn!(tag = %tag, error = %e, "Failed to purge superseded tag entries");
                }
            }
        }
        Ok(purged)
    }

    /// Register `key` under the given tag versions so it can be listed and
    /// purged later.
    pub async fn register(
        &self,
        key: &CacheKey,
        versions: &BTreeMap<Tag, TagVersion>,
        ttl: std::time::Duration,
    ) -> QueryCacheResult<()> {
        for (tag, version) in versions {
            self.store
                .add_tag_entry(&self.tag_set_key(tag, version), key.as_str(), ttl)
                .await?;
        }
        Ok(())
    }

    /// Entries registered under the current version of `tag`.
    ///
    /// Read-only: a tag that has no version yet has no entries.
    pub async fn entries(&self, tag: &Tag) -> QueryCacheResult<Vec<String>> {
        match self.read_version(tag).await? {
            Some(version) => self.store.tag_entries(&self.tag_set_key(tag, &version)).await,
            None => Ok(Vec::new()),
        }
    }
}

impl fmt::Debug for TagVersionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagVersionStore")
            .field("store", &self.store.name())
            .field("prefix", &self.prefix)
            .finish()
    }
}
