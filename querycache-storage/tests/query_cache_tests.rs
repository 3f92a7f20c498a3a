//! End-to-end tests for cached reads, invalidation and stampede protection

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use querycache_core::{BackendError, EntityIdentity, InputError, QueryCacheConfig, QueryCacheError};
use querycache_storage::{
    CacheOptions, CacheStore, DataSource, InvalidationTrigger, LmdbCacheStore, MutationEvent,
    QueryCache, StoreRegistry,
};
use querycache_test_utils::fixtures::{blog, memory_cache};
use querycache_test_utils::generators::{
    arb_entity_identity, arb_tag, arb_tag_names, arb_valid_config,
};
use querycache_test_utils::{init_tracing, MemoryDatabase, MemoryQuery, MemoryStatement};
use serde_json::json;

fn posts_query() -> String {
    MemoryQuery::table("posts").to_text()
}

fn as_source(db: &Arc<MemoryDatabase>) -> Arc<dyn DataSource> {
    db.clone()
}

#[tokio::test]
async fn test_repeated_read_runs_source_once() {
    init_tracing();
    let (cache, _) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());

    let conn = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts"))
        .unwrap();
    let first = conn.select(&posts_query(), &[]).await.unwrap();
    let second = conn.select(&posts_query(), &[]).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    assert_eq!(db.select_count(), 1);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.stores, 1);
}

#[tokio::test]
async fn test_bindings_are_part_of_the_key() {
    let (cache, _) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let conn = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts"))
        .unwrap();

    conn.select(&posts_query(), &[json!(1)]).await.unwrap();
    conn.select(&posts_query(), &[json!(2)]).await.unwrap();
    conn.select(&posts_query(), &[json!(1)]).await.unwrap();
    assert_eq!(db.select_count(), 2);
}

#[tokio::test]
async fn test_forget_makes_next_read_see_writes() {
    let (cache, _) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let conn = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts"))
        .unwrap();

    assert_eq!(conn.select(&posts_query(), &[]).await.unwrap().len(), 3);

    let insert = MemoryStatement::Insert {
        table: "posts".to_string(),
        row: json!({"id": 4, "user_id": 1, "title": "New"})
            .as_object()
            .cloned()
            .unwrap(),
    };
    assert_eq!(conn.statement(&insert.to_text(), &[]).await.unwrap(), 1);

    // Still cached until the tag is forgotten.
    assert_eq!(conn.select(&posts_query(), &[]).await.unwrap().len(), 3);

    cache.forget(&["posts"]).await.unwrap();
    assert_eq!(conn.select(&posts_query(), &[]).await.unwrap().len(), 4);
    assert_eq!(db.select_count(), 2);
}

#[tokio::test]
async fn test_forget_leaves_other_tags_alone() {
    let (cache, _) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let posts = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts"))
        .unwrap();
    let users = cache
        .connection(as_source(&db), CacheOptions::new().tag("users"))
        .unwrap();
    let users_query = MemoryQuery::table("users").to_text();

    posts.select(&posts_query(), &[]).await.unwrap();
    users.select(&users_query, &[]).await.unwrap();
    cache.forget(&["posts"]).await.unwrap();

    users.select(&users_query, &[]).await.unwrap();
    assert_eq!(db.select_count(), 2);
    posts.select(&posts_query(), &[]).await.unwrap();
    assert_eq!(db.select_count(), 3);
}

#[tokio::test]
async fn test_forget_purges_registered_keys() {
    let (cache, store) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let conn = cache
        .connection(as_source(&db), CacheOptions::new().tags(["posts", "users"]))
        .unwrap();
    conn.select(&posts_query(), &[]).await.unwrap();

    let keys = cache.tagged_entries("posts").await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(cache.tagged_entries("users").await.unwrap(), keys);
    assert!(store.entry(&keys[0]).await.is_some());

    assert_eq!(cache.forget(&["posts"]).await.unwrap(), 1);
    assert!(store.entry(&keys[0]).await.is_none());
}

#[tokio::test]
async fn test_entity_mutation_invalidates_entity_reads() {
    let (cache, _) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let conn = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts_1"))
        .unwrap();
    let query = MemoryQuery::table("posts").where_eq("id", 1).to_text();

    conn.select(&query, &[]).await.unwrap();
    conn.select(&query, &[]).await.unwrap();
    assert_eq!(db.select_count(), 1);

    let trigger = InvalidationTrigger::new(cache.tag_versions(None).unwrap());
    trigger
        .committed(&MutationEvent::updated(EntityIdentity::new("posts", "1")))
        .await
        .unwrap();

    conn.select(&query, &[]).await.unwrap();
    assert_eq!(db.select_count(), 2);
}

#[tokio::test]
async fn test_route_key_with_spaces_invalidates_entity_reads() {
    let (cache, _) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let by_table = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts"))
        .unwrap();
    let by_slug = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts_hello world"))
        .unwrap();
    let slug_query = MemoryQuery::table("posts").where_eq("id", 1).to_text();

    by_table.select(&posts_query(), &[]).await.unwrap();
    by_slug.select(&slug_query, &[]).await.unwrap();
    assert_eq!(db.select_count(), 2);

    let trigger = InvalidationTrigger::new(cache.tag_versions(None).unwrap());
    trigger
        .committed(&MutationEvent::updated(
            EntityIdentity::new("posts", "1").with_route_key("hello world"),
        ))
        .await
        .unwrap();

    by_table.select(&posts_query(), &[]).await.unwrap();
    by_slug.select(&slug_query, &[]).await.unwrap();
    assert_eq!(db.select_count(), 4);
}

#[tokio::test]
async fn test_rolled_back_mutations_keep_entries() {
    let (cache, _) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let conn = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts"))
        .unwrap();
    conn.select(&posts_query(), &[]).await.unwrap();

    let trigger = InvalidationTrigger::new(cache.tag_versions(None).unwrap());
    let mut pending = trigger.begin();
    pending.push(MutationEvent::deleted(EntityIdentity::new("posts", "2")));
    pending.rollback();

    conn.select(&posts_query(), &[]).await.unwrap();
    assert_eq!(db.select_count(), 1);

    let mut pending = trigger.begin();
    pending.push(MutationEvent::created(EntityIdentity::new("posts", "9")));
    pending.commit().await.unwrap();

    conn.select(&posts_query(), &[]).await.unwrap();
    assert_eq!(db.select_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_run_source_once() {
    let (cache, _) = memory_cache(
        QueryCacheConfig::default().with_lock_wait(Duration::from_secs(5)),
    );
    let db = Arc::new(blog().with_latency(Duration::from_millis(100)));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let source = as_source(&db);
        handles.push(tokio::spawn(async move {
            let conn = cache
                .connection(source, CacheOptions::new().tag("posts"))
                .unwrap();
            conn.select(&posts_query(), &[]).await.unwrap()
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(db.select_count(), 1);
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(cache.stats().misses, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_lock_wait_lets_every_miss_through() {
    let (cache, _) = memory_cache(QueryCacheConfig::default().with_lock_wait(Duration::ZERO));
    let db = Arc::new(blog().with_latency(Duration::from_millis(250)));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let source = as_source(&db);
        handles.push(tokio::spawn(async move {
            let conn = cache
                .connection(source, CacheOptions::new().tag("posts"))
                .unwrap();
            conn.select(&posts_query(), &[]).await.unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(db.select_count(), 4);
}

#[tokio::test]
async fn test_outage_bypasses_cache() {
    let (cache, store) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let conn = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts"))
        .unwrap();

    store.simulate_outage(true);
    assert_eq!(conn.select(&posts_query(), &[]).await.unwrap().len(), 3);
    assert_eq!(conn.select(&posts_query(), &[]).await.unwrap().len(), 3);
    assert_eq!(db.select_count(), 2);
    assert_eq!(cache.stats().bypasses, 2);

    store.simulate_outage(false);
    conn.select(&posts_query(), &[]).await.unwrap();
    conn.select(&posts_query(), &[]).await.unwrap();
    assert_eq!(db.select_count(), 3);
}

#[tokio::test]
async fn test_source_errors_pass_through() {
    let (cache, store) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let conn = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts"))
        .unwrap();

    let err = conn
        .select(&MemoryQuery::table("nope").to_text(), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, QueryCacheError::Source(_)));
    assert_eq!(cache.stats().stores, 0);
    assert!(cache.tagged_entries("posts").await.unwrap().is_empty());
    // Only the tag version written while resolving the key.
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_disabled_cache_returns_source() {
    let (cache, store) = memory_cache(QueryCacheConfig::default().with_enable(false));
    let db = Arc::new(blog());

    // Tags are not even checked while disabled.
    let conn = cache.connection(as_source(&db), CacheOptions::new()).unwrap();
    let direct = db.select(&posts_query(), &[]).await.unwrap();
    let through = conn.select(&posts_query(), &[]).await.unwrap();
    conn.select(&posts_query(), &[]).await.unwrap();

    assert_eq!(direct, through);
    assert_eq!(db.select_count(), 3);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_missing_tags_are_rejected() {
    let (cache, _) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());

    let err = cache
        .connection(as_source(&db), CacheOptions::new())
        .err()
        .unwrap();
    assert_eq!(err, QueryCacheError::Input(InputError::MissingTags));
    assert_eq!(db.select_count(), 0);
}

#[tokio::test]
async fn test_locking_required_for_nonzero_wait() {
    let store: Arc<dyn CacheStore> =
        Arc::new(querycache_storage::InMemoryCacheStore::new("plain").with_locking(false));
    let registry = StoreRegistry::single("plain", store);

    let err = QueryCache::new(QueryCacheConfig::default(), registry.clone())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        QueryCacheError::Backend(BackendError::UnsupportedCapability { .. })
    ));

    let cache = QueryCache::new(
        QueryCacheConfig::default().with_lock_wait(Duration::ZERO),
        registry,
    )
    .unwrap();
    let db = Arc::new(blog());
    let conn = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts"))
        .unwrap();
    conn.select(&posts_query(), &[]).await.unwrap();
    conn.select(&posts_query(), &[]).await.unwrap();
    assert_eq!(db.select_count(), 1);

    let err = cache
        .connection(
            as_source(&db),
            CacheOptions::new().tag("posts").wait(Duration::from_secs(1)),
        )
        .err()
        .unwrap();
    assert!(matches!(
        err,
        QueryCacheError::Backend(BackendError::UnsupportedCapability { .. })
    ));
}

#[tokio::test]
async fn test_named_stores_are_independent() {
    let default_store = Arc::new(querycache_storage::InMemoryCacheStore::new("memory"));
    let other_store = Arc::new(querycache_storage::InMemoryCacheStore::new("other"));
    let registry = StoreRegistry::new()
        .with_store("memory", default_store.clone() as Arc<dyn CacheStore>)
        .with_store("other", other_store.clone() as Arc<dyn CacheStore>)
        .with_default("memory");
    let cache = QueryCache::new(QueryCacheConfig::default(), registry).unwrap();
    let db = Arc::new(blog());

    let conn = cache
        .connection(
            as_source(&db),
            CacheOptions::new().tag("posts").store("other"),
        )
        .unwrap();
    conn.select(&posts_query(), &[]).await.unwrap();
    assert!(default_store.is_empty().await);
    assert!(!other_store.is_empty().await);

    // Forgetting in the default store does not reach the other one.
    cache.forget(&["posts"]).await.unwrap();
    conn.select(&posts_query(), &[]).await.unwrap();
    assert_eq!(db.select_count(), 1);

    cache.forget_in(Some("other"), &["posts"]).await.unwrap();
    conn.select(&posts_query(), &[]).await.unwrap();
    assert_eq!(db.select_count(), 2);
}

#[tokio::test]
async fn test_lmdb_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CacheStore> = Arc::new(LmdbCacheStore::open(dir.path(), 16).unwrap());
    let cache = QueryCache::new(
        QueryCacheConfig::default(),
        StoreRegistry::single("lmdb", store),
    )
    .unwrap();
    let db = Arc::new(blog());
    let conn = cache
        .connection(as_source(&db), CacheOptions::new().tag("posts"))
        .unwrap();

    let first = conn.select(&posts_query(), &[]).await.unwrap();
    let second = conn.select(&posts_query(), &[]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(db.select_count(), 1);

    assert_eq!(cache.forget(&["posts"]).await.unwrap(), 1);
    conn.select(&posts_query(), &[]).await.unwrap();
    assert_eq!(db.select_count(), 2);
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn prop_valid_configs_build_a_cache(config in arb_valid_config()) {
        prop_assert!(config.validate().is_ok());
        let (cache, _) = memory_cache(config.clone());
        prop_assert_eq!(cache.config(), &config);
    }

    #[test]
    fn prop_committed_mutation_bumps_every_entity_tag(identity in arb_entity_identity()) {
        block_on(async {
            let (cache, _) = memory_cache(QueryCacheConfig::default());
            let versions = cache.tag_versions(None).unwrap();
            let tags = identity.cache_tags().unwrap();
            let before = versions.resolve_versions(&tags).await.unwrap();

            InvalidationTrigger::new(versions.clone())
                .committed(&MutationEvent::updated(identity.clone()))
                .await
                .unwrap();

            let after = versions.resolve_versions(&tags).await.unwrap();
            for tag in &tags {
                assert_ne!(before[tag], after[tag], "tag {tag} kept its version");
            }
        });
    }

    #[test]
    fn prop_forget_leaves_unnamed_tags(forgotten in arb_tag(), kept in arb_tag()) {
        prop_assume!(forgotten != kept);
        block_on(async {
            let (cache, _) = memory_cache(QueryCacheConfig::default());
            let versions = cache.tag_versions(None).unwrap();
            let both = [forgotten.clone(), kept.clone()];
            let before = versions.resolve_versions(&both).await.unwrap();

            cache.forget(&[forgotten.as_str()]).await.unwrap();

            let after = versions.resolve_versions(&both).await.unwrap();
            assert_ne!(before[&forgotten], after[&forgotten]);
            assert_eq!(before[&kept], after[&kept]);
        });
    }

    #[test]
    fn prop_tag_names_are_accepted_as_options(names in arb_tag_names()) {
        let tags = CacheOptions::new()
            .tags(names.iter().map(String::as_str))
            .effective_tags()
            .unwrap();
        prop_assert_eq!(tags.len(), names.len());
    }
}
