//! Entity mutation handling.
//!
//! Mutations invalidate the entity's own tags: its table, its route-key tag
//! and its primary-key tag. Events must only reach the trigger once the
//! mutation is committed; [`PendingInvalidations`] holds events raised
//! inside a transaction until the outcome is known.

use querycache_core::{EntityIdentity, QueryCacheResult, Tag, TagSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::tag_versions::TagVersionStore;

/// Kind of entity mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
    ForceDeleted,
    Restored,
}

/// A committed change to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub kind: MutationKind,
    pub entity: EntityIdentity,
}

impl MutationEvent {
    pub fn new(kind: MutationKind, entity: EntityIdentity) -> Self {
        Self { kind, entity }
    }

    pub fn created(entity: EntityIdentity) -> Self {
        Self::new(MutationKind::Created, entity)
    }

    pub fn updated(entity: EntityIdentity) -> Self {
        Self::new(MutationKind::Updated, entity)
    }

    pub fn deleted(entity: EntityIdentity) -> Self {
        Self::new(MutationKind::Deleted, entity)
    }

    pub fn force_deleted(entity: EntityIdentity) -> Self {
        Self::new(MutationKind::ForceDeleted, entity)
    }

    pub fn restored(entity: EntityIdentity) -> Self {
        Self::new(MutationKind::Restored, entity)
    }
}

/// Bumps the tags of mutated entities.
#[derive(Debug, Clone)]
pub struct InvalidationTrigger {
    versions: TagVersionStore,
}

impl InvalidationTrigger {
    pub fn new(versions: TagVersionStore) -> Self {
        Self { versions }
    }

    /// Invalidate after a committed mutation.
    ///
    /// A failure is logged and returned; invalidation never fails silently.
    pub async fn committed(&self, event: &MutationEvent) -> QueryCacheResult<()> {
        let tags = event.entity.cache_tags()?;
        self.forget(&tags, event).await
    }

    /// Start buffering events for a transaction.
    pub fn begin(&self) -> PendingInvalidations {
        PendingInvalidations {
            trigger: self.clone(),
            events: Vec::new(),
        }
    }

    /// Process committed events until every sender is dropped.
    ///
    /// Failures are logged and do not stop the loop. Returns the number of
    /// events handled successfully.
    pub async fn run(&self, mut events: mpsc::Receiver<MutationEvent>) -> usize {
        let mut handled = 0;
        while let Some(event) = events.recv().await {
            if self.committed(&event).await.is_ok() {
                handled += 1;
            }
        }
        tracing::debug!(handled, "Invalidation channel closed");
        handled
    }

    async fn forget(&self, tags: &[Tag], event: &MutationEvent) -> QueryCacheResult<()> {
        match self.versions.forget(tags).await {
            Ok(purged) => {
                tracing::debug!(
                    table = %event.entity.table,
                    key = %event.entity.key,
                    kind = ?event.kind,
                    purged,
                    "Invalidated entity tags"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    table = %event.entity.table,
                    key = %event.entity.key,
                    kind = ?event.kind,
                    error = %e,
                    "Failed to invalidate entity tags"
                );
                Err(e)
            }
        }
    }
}

/// Events raised inside a transaction. Dropping without `commit` discards
/// them.
#[derive(Debug)]
pub struct PendingInvalidations {
    trigger: InvalidationTrigger,
    events: Vec<MutationEvent>,
}

impl PendingInvalidations {
    pub fn push(&mut self, event: MutationEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Fire every buffered event as one bump over the union of their tags.
    pub async fn commit(mut self) -> QueryCacheResult<()> {
        let events = std::mem::take(&mut self.events);
        let Some(first) = events.first() else {
            return Ok(());
        };

        let mut tags = TagSet::new();
        for event in &events {
            tags.extend(event.entity.cache_tags()?);
        }
        self.trigger.forget(tags.as_slice(), first).await
    }

    /// Discard the buffered events.
    pub fn rollback(self) {}
}

impl Drop for PendingInvalidations {
    fn drop(&mut self) {
        if !self.events.is_empty() {
            tracing::debug!(
                count = self.events.len(),
                "Discarded invalidations of uncommitted transaction"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory_backend::InMemoryCacheStore;
    use std::sync::Arc;

    fn trigger() -> (Arc<InMemoryCacheStore>, TagVersionStore, InvalidationTrigger) {
        let store = Arc::new(InMemoryCacheStore::default());
        let versions = TagVersionStore::new(store.clone(), "q");
        (store, versions.clone(), InvalidationTrigger::new(versions))
    }

    fn post(id: &str) -> EntityIdentity {
        EntityIdentity::new("posts", id).with_route_key(format!("slug-{id}"))
    }

    async fn version(versions: &TagVersionStore, tag: &str) -> String {
        versions
            .current_version(&Tag::new(tag).unwrap())
            .await
            .unwrap()
            .as_str()
            .to_string()
    }

    #[tokio::test]
    async fn test_committed_bumps_entity_tags() {
        let (_, versions, trigger) = trigger();
        let table = version(&versions, "posts").await;
        let by_key = version(&versions, "posts_7").await;
        let by_route = version(&versions, "posts_slug-7").await;
        let other = version(&versions, "posts_8").await;

        trigger.committed(&MutationEvent::updated(post("7"))).await.unwrap();

        assert_ne!(table, version(&versions, "posts").await);
        assert_ne!(by_key, version(&versions, "posts_7").await);
        assert_ne!(by_route, version(&versions, "posts_slug-7").await);
        assert_eq!(other, version(&versions, "posts_8").await);
    }

    #[tokio::test]
    async fn test_committed_reports_backend_failure() {
        let (store, _, trigger) = trigger();
        store.simulate_outage(true);
        let err = trigger
            .committed(&MutationEvent::deleted(post("1")))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_events() {
        let (_, versions, trigger) = trigger();
        let before = version(&versions, "posts").await;

        let mut pending = trigger.begin();
        pending.push(MutationEvent::created(post("1")));
        pending.rollback();

        {
            let mut pending = trigger.begin();
            pending.push(MutationEvent::created(post("2")));
        }

        assert_eq!(before, version(&versions, "posts").await);
    }

    #[tokio::test]
    async fn test_commit_fires_buffered_events() {
        let (_, versions, trigger) = trigger();
        let one = version(&versions, "posts_1").await;
        let two = version(&versions, "posts_2").await;

        let mut pending = trigger.begin();
        pending.push(MutationEvent::created(post("1")));
        pending.push(MutationEvent::force_deleted(post("2")));
        assert_eq!(pending.len(), 2);
        pending.commit().await.unwrap();

        assert_ne!(one, version(&versions, "posts_1").await);
        assert_ne!(two, version(&versions, "posts_2").await);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (_, versions, trigger) = trigger();
        let before = version(&versions, "posts_3").await;

        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn({
            let trigger = trigger.clone();
            async move { trigger.run(rx).await }
        });
        tx.send(MutationEvent::restored(post("3"))).await.unwrap();
        tx.send(MutationEvent::updated(post("4"))).await.unwrap();
        drop(tx);

        assert_eq!(worker.await.unwrap(), 2);
        assert_ne!(before, version(&versions, "posts_3").await);
    }
}
