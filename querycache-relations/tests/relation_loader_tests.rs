//! End-to-end tests for cached relation and aggregate loading

use std::sync::Arc;

use proptest::prelude::*;
use querycache_core::{InputError, QueryCacheConfig, QueryCacheError, ResultSet, Tag};
use querycache_relations::{
    Direction, LoadPlan, MorphSpec, Record, Related, RelationLoader, RelationSource,
    RelationSpec,
};
use querycache_storage::{CacheOptions, DataSource, QueryCache};
use querycache_test_utils::fixtures::{blog, memory_cache, posts};
use querycache_test_utils::generators::arb_relation_path;
use querycache_test_utils::{init_tracing, MemoryDatabase};
use serde_json::json;

fn loader(cache: &QueryCache, db: &Arc<MemoryDatabase>) -> RelationLoader {
    let source: Arc<dyn DataSource> = db.clone();
    let relations: Arc<dyn RelationSource> = db.clone();
    RelationLoader::new(cache.clone(), source, relations)
}

fn setup() -> (QueryCache, Arc<MemoryDatabase>, RelationLoader) {
    let (cache, _) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let loader = loader(&cache, &db);
    (cache, db, loader)
}

fn comment_ids(record: &Record, relation: &str) -> Vec<i64> {
    record
        .relation(relation)
        .map(|related| {
            related
                .records()
                .iter()
                .filter_map(|r| r.key().and_then(|k| k.as_i64()))
                .collect()
        })
        .unwrap_or_default()
}

fn one<'a>(record: &'a Record, relation: &str) -> Option<&'a Record> {
    match record.relation(relation) {
        Some(Related::One(Some(target))) => Some(target.as_ref()),
        _ => None,
    }
}

#[tokio::test]
async fn test_has_many_is_loaded_and_cached() {
    init_tracing();
    let (_, db, loader) = setup();

    let mut first = posts(&db);
    loader.load_cached(&mut first, "comments", &[]).await.unwrap();
    assert_eq!(db.select_count(), 1);
    assert_eq!(comment_ids(&first[0], "comments"), vec![1, 2, 3]);
    assert_eq!(comment_ids(&first[1], "comments"), vec![5]);
    assert!(first[2].relation_loaded("comments"));
    assert!(first[2].relation("comments").unwrap().is_empty());

    let mut second = posts(&db);
    loader.load_cached(&mut second, "comments", &[]).await.unwrap();
    assert_eq!(db.select_count(), 1);
    assert_eq!(comment_ids(&second[0], "comments"), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_related_and_parent_tables_invalidate_loads() {
    let (cache, db, loader) = setup();
    let mut records = posts(&db);
    loader.load_cached(&mut records, "comments", &[]).await.unwrap();

    cache.forget(&["users"]).await.unwrap();
    loader.load_cached(&mut posts(&db), "comments", &[]).await.unwrap();
    assert_eq!(db.select_count(), 1);

    cache.forget(&["comments"]).await.unwrap();
    loader.load_cached(&mut posts(&db), "comments", &[]).await.unwrap();
    assert_eq!(db.select_count(), 2);

    cache.forget(&["posts"]).await.unwrap();
    loader.load_cached(&mut posts(&db), "comments", &[]).await.unwrap();
    assert_eq!(db.select_count(), 3);
}

#[tokio::test]
async fn test_explicit_tags_replace_default_base_tag() {
    let (cache, db, loader) = setup();
    loader
        .load_cached(&mut posts(&db), "comments", &["frontpage"])
        .await
        .unwrap();

    cache.forget(&["frontpage"]).await.unwrap();
    loader
        .load_cached(&mut posts(&db), "comments", &["frontpage"])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 2);
}

#[tokio::test]
async fn test_shared_prefixes_load_once() {
    let (_, db, loader) = setup();
    let mut records = posts(&db);
    loader
        .load_cached(&mut records, ["comments.author", "comments", "author"], &[])
        .await
        .unwrap();

    // comments, comments.author, author
    assert_eq!(db.select_count(), 3);
    let comments = records[0].relation("comments").unwrap().records();
    let first_comment = comments[0];
    assert_eq!(one(first_comment, "author").unwrap().get("name"), Some(&json!("linus")));
    assert_eq!(one(&records[2], "author").unwrap().get("name"), Some(&json!("grace")));
}

#[tokio::test]
async fn test_scope_applies_to_last_segment() {
    let (_, db, loader) = setup();
    let mut records = posts(&db);
    loader
        .load_cached(&mut records, "comments:withTrashed", &[])
        .await
        .unwrap();
    assert_eq!(comment_ids(&records[0], "comments"), vec![1, 2, 3, 4]);

    let mut records = posts(&db);
    loader
        .load_cached(&mut records, "comments:onlyTrashed", &[])
        .await
        .unwrap();
    assert_eq!(comment_ids(&records[0], "comments"), vec![4]);
    assert_eq!(db.select_count(), 2);
}

#[tokio::test]
async fn test_constraint_filters_and_tags_the_load() {
    let (cache, db, loader) = setup();
    let spec = || {
        RelationSpec::new().constrained("comments", |q| {
            q.where_eq("user_id", 2)
                .order_by("votes", Direction::Desc)
                .tag("moderation");
        })
    };

    let mut records = posts(&db);
    loader.load_cached(&mut records, spec(), &[]).await.unwrap();
    assert_eq!(comment_ids(&records[0], "comments"), vec![1]);
    assert!(records[1].relation("comments").unwrap().is_empty());

    loader.load_cached(&mut posts(&db), spec(), &[]).await.unwrap();
    assert_eq!(db.select_count(), 1);

    cache.forget(&["moderation"]).await.unwrap();
    loader.load_cached(&mut posts(&db), spec(), &[]).await.unwrap();
    assert_eq!(db.select_count(), 2);
}

#[tokio::test]
async fn test_constraint_limit_caps_the_whole_load() {
    let (_, db, loader) = setup();
    let mut records = posts(&db);
    let spec = RelationSpec::new().constrained("comments", |q| {
        q.order_by("id", Direction::Asc).limit(2);
    });
    loader.load_cached(&mut records, spec, &[]).await.unwrap();

    let total: usize = records
        .iter()
        .map(|r| r.relation("comments").map_or(0, Related::len))
        .sum();
    assert_eq!(total, 2);
    assert_eq!(comment_ids(&records[0], "comments"), vec![1, 2]);
}

#[tokio::test]
async fn test_through_relation_tags_every_table() {
    let (cache, db, loader) = setup();
    let mut countries = db.records("countries");
    loader.load_cached(&mut countries, "posts", &[]).await.unwrap();

    // The intermediate table and then the far table.
    assert_eq!(db.select_count(), 2);
    assert_eq!(comment_ids(&countries[0], "posts"), vec![1, 2]);
    assert_eq!(comment_ids(&countries[1], "posts"), vec![3]);

    loader
        .load_cached(&mut db.records("countries"), "posts", &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 2);

    cache.forget(&["users"]).await.unwrap();
    loader
        .load_cached(&mut db.records("countries"), "posts", &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 4);
}

#[test]
fn test_through_context_tag_union() {
    let relation = blog().relation("countries", "posts").unwrap();
    let tags = CacheOptions::new()
        .tag("A")
        .relation(relation.context())
        .effective_tags()
        .unwrap();
    let names: Vec<&str> = tags.iter().map(Tag::as_str).collect();
    assert_eq!(names, vec!["A", "posts", "countries", "users"]);
}

#[tokio::test]
async fn test_single_record_uses_model_cache_key() {
    let (cache, db, loader) = setup();
    let mut post = posts(&db).remove(0);
    loader
        .load_record_cached(&mut post, "comments", &[])
        .await
        .unwrap();
    assert_eq!(comment_ids(&post, "comments"), vec![1, 2, 3]);

    let mut again = posts(&db).remove(0);
    loader
        .load_record_cached(&mut again, "comments", &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 1);

    cache.forget(&["posts:1"]).await.unwrap();
    loader
        .load_record_cached(&mut posts(&db).remove(0), "comments", &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 2);
}

#[tokio::test]
async fn test_load_missing_skips_loaded_relations() {
    let (_, db, loader) = setup();
    let mut records = posts(&db);
    loader.load_cached(&mut records, "comments", &[]).await.unwrap();
    assert_eq!(db.select_count(), 1);

    loader
        .load_missing_cached(&mut records, "comments.author", &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 2);
    for comment in records[0].relation("comments").unwrap().records() {
        assert!(comment.relation_loaded("author"));
    }

    db.reset_counts();
    loader
        .load_missing_cached(&mut records, "comments.author", &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 0);
}

#[tokio::test]
async fn test_load_record_missing_tops_up() {
    let (_, db, loader) = setup();
    let mut post = posts(&db).remove(0);
    loader
        .load_record_missing_cached(&mut post, ["author", "comments"], &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 2);

    loader
        .load_record_missing_cached(&mut post, ["author", "comments.post"], &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 3);
    assert_eq!(one(&post, "author").unwrap().get("name"), Some(&json!("ada")));
}

#[tokio::test]
async fn test_morph_to_groups_by_type() {
    let (_, db, loader) = setup();
    let mut images = db.records("images");
    loader.load_cached(&mut images, "imageable", &[]).await.unwrap();

    // One load per target table.
    assert_eq!(db.select_count(), 3);
    assert_eq!(one(&images[0], "imageable").unwrap().table, "posts");
    assert_eq!(one(&images[1], "imageable").unwrap().table, "videos");
    assert_eq!(one(&images[2], "imageable").unwrap().table, "podcasts");
    assert_eq!(one(&images[3], "imageable").unwrap().key(), Some(&json!(2)));
}

#[tokio::test]
async fn test_morph_spec_skips_unlisted_types() {
    let (_, db, loader) = setup();
    let mut images = db.records("images");
    loader.load_cached(&mut images, "imageable", &[]).await.unwrap();
    db.reset_counts();

    let spec = MorphSpec::new().on("posts", "comments").on("videos", "author");
    loader
        .load_morph_cached(&mut images, "imageable", &spec, &[])
        .await
        .unwrap();

    assert_eq!(db.select_count(), 2);
    let post = one(&images[0], "imageable").unwrap();
    assert_eq!(comment_ids(post, "comments"), vec![1, 2, 3]);
    let video = one(&images[1], "imageable").unwrap();
    assert_eq!(one(video, "author").unwrap().get("name"), Some(&json!("grace")));
    let podcast = one(&images[2], "imageable").unwrap();
    assert!(podcast.relations.is_empty());
}

#[tokio::test]
async fn test_missing_morph_type_loads_nothing() {
    let (_, db, loader) = setup();
    db.insert("images", json!({"id": 5, "imageable_type": null, "imageable_id": null}));
    let mut images = db.records("images");
    loader.load_cached(&mut images, "imageable", &[]).await.unwrap();

    assert!(images[4].relation_loaded("imageable"));
    assert!(one(&images[4], "imageable").is_none());
}

#[tokio::test]
async fn test_count_and_exists_aggregates() {
    let (_, db, loader) = setup();
    let mut records = posts(&db);
    loader.load_count_cached(&mut records, "comments", &[]).await.unwrap();
    loader
        .load_exists_cached(&mut records, "comments as has_comments", &[])
        .await
        .unwrap();

    assert_eq!(records[0].get("comments_count"), Some(&json!(3)));
    assert_eq!(records[2].get("comments_count"), Some(&json!(0)));
    assert_eq!(records[0].get("has_comments"), Some(&json!(true)));
    assert_eq!(records[2].get("has_comments"), Some(&json!(false)));
    // Aggregates do not load the relation itself.
    assert!(!records[0].relation_loaded("comments"));
}

#[tokio::test]
async fn test_column_aggregates() {
    let (_, db, loader) = setup();
    let mut records = posts(&db);
    loader
        .load_sum_cached(&mut records, "comments", "votes", &[])
        .await
        .unwrap();
    loader
        .load_min_cached(&mut records, "comments", "votes", &[])
        .await
        .unwrap();
    loader
        .load_max_cached(&mut records, "comments", "votes", &[])
        .await
        .unwrap();
    loader
        .load_avg_cached(&mut records, "comments as replies", "votes", &[])
        .await
        .unwrap();

    assert_eq!(records[0].get("comments_sum_votes"), Some(&json!(9)));
    assert_eq!(records[0].get("comments_min_votes"), Some(&json!(1)));
    assert_eq!(records[0].get("comments_max_votes"), Some(&json!(5)));
    assert_eq!(records[0].get("replies"), Some(&json!(3.0)));
    // Empty relations aggregate to null, which reads back as absent.
    assert_eq!(records[2].get("comments_sum_votes"), None);
}

#[tokio::test]
async fn test_aggregates_are_cached_and_invalidated() {
    let (cache, db, loader) = setup();
    loader
        .load_count_cached(&mut posts(&db), "comments", &[])
        .await
        .unwrap();
    loader
        .load_count_cached(&mut posts(&db), "comments", &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 1);

    cache.forget(&["comments"]).await.unwrap();
    loader
        .load_count_cached(&mut posts(&db), "comments", &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 2);
}

#[tokio::test]
async fn test_aggregates_cache_one_scalar_per_parent() {
    let (cache, store) = memory_cache(QueryCacheConfig::default());
    let db = Arc::new(blog());
    let loader = loader(&cache, &db);
    loader
        .load_count_cached(&mut posts(&db), "comments", &[])
        .await
        .unwrap();

    let keys = cache.tagged_entries("comments").await.unwrap();
    assert_eq!(keys.len(), 1);
    let entry = store.entry(&keys[0]).await.unwrap();
    let rows: ResultSet = serde_json::from_slice(&entry.payload).unwrap();

    // Posts 1 and 2 have comments; post 3 falls back to zero.
    assert_eq!(rows.len(), 2);
    for row in &rows {
        let mut columns: Vec<&str> = row.keys().map(String::as_str).collect();
        columns.sort();
        assert_eq!(columns, vec!["aggregate", "group"]);
    }
    assert!(rows.contains(&json!({"group": 1, "aggregate": 3}).as_object().cloned().unwrap()));
}

#[tokio::test]
async fn test_through_aggregate_runs_one_grouped_query() {
    let (cache, db, loader) = setup();
    let mut countries = db.records("countries");
    loader.load_count_cached(&mut countries, "posts", &[]).await.unwrap();
    loader
        .load_max_cached(&mut countries, "posts as latest_post", "id", &[])
        .await
        .unwrap();

    assert_eq!(countries[0].get("posts_count"), Some(&json!(2)));
    assert_eq!(countries[1].get("posts_count"), Some(&json!(1)));
    assert_eq!(countries[0].get("latest_post"), Some(&json!(2)));
    assert_eq!(db.select_count(), 2);

    cache.forget(&["users"]).await.unwrap();
    loader
        .load_count_cached(&mut db.records("countries"), "posts", &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 3);
}

#[tokio::test]
async fn test_record_aggregate_and_morph_count() {
    let (_, db, loader) = setup();
    let mut post = posts(&db).remove(1);
    loader
        .load_record_count_cached(&mut post, "comments", &[])
        .await
        .unwrap();
    assert_eq!(post.get("comments_count"), Some(&json!(1)));

    let mut images = db.records("images");
    loader.load_cached(&mut images, "imageable", &[]).await.unwrap();
    loader
        .load_morph_count_cached(
            &mut images,
            "imageable",
            &MorphSpec::new().on("posts", "comments"),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(
        one(&images[0], "imageable").unwrap().get("comments_count"),
        Some(&json!(3))
    );
    assert_eq!(one(&images[1], "imageable").unwrap().get("comments_count"), None);
}

#[tokio::test]
async fn test_disabled_cache_gives_same_results() {
    let (cache, _) = memory_cache(QueryCacheConfig::default().with_enable(false));
    let db = Arc::new(blog());
    let loader = loader(&cache, &db);

    let mut records = posts(&db);
    loader.load_count_cached(&mut records, "comments", &[]).await.unwrap();
    loader.load_cached(&mut records, "comments.author", &[]).await.unwrap();
    assert_eq!(records[0].get("comments_count"), Some(&json!(3)));
    assert_eq!(comment_ids(&records[0], "comments"), vec![1, 2, 3]);

    loader.load_count_cached(&mut posts(&db), "comments", &[]).await.unwrap();
    assert_eq!(db.select_count(), 4);
}

#[tokio::test]
async fn test_invalid_requests_fail_before_loading() {
    let (_, db, loader) = setup();

    let err = loader
        .load_cached(&mut posts(&db), "nope", &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryCacheError::Input(InputError::UnknownRelation { .. })
    ));

    let err = loader
        .load_cached(&mut posts(&db), "comments..author", &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryCacheError::Input(InputError::InvalidRelationPath { .. })
    ));

    let err = loader
        .load_count_cached(&mut posts(&db), "comments.author", &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryCacheError::Input(InputError::InvalidRelationPath { .. })
    ));

    let mut images = db.records("images");
    let err = loader
        .load_count_cached(&mut images, "imageable", &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryCacheError::Input(InputError::UnsupportedAggregate { .. })
    ));
    assert_eq!(db.select_count(), 0);
}

#[tokio::test]
async fn test_empty_input_is_a_no_op() {
    let (_, db, loader) = setup();
    let mut none: Vec<Record> = Vec::new();
    loader.load_cached(&mut none, "comments", &[]).await.unwrap();
    loader.load_count_cached(&mut none, "comments", &[]).await.unwrap();
    loader
        .load_cached(&mut posts(&db), RelationSpec::new(), &[])
        .await
        .unwrap();
    assert_eq!(db.select_count(), 0);
}

proptest! {
    #[test]
    fn prop_plan_has_one_node_per_distinct_prefix(
        paths in proptest::collection::vec(arb_relation_path(), 1..6)
    ) {
        let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        let plan = LoadPlan::parse(&RelationSpec::from(refs)).unwrap();

        let mut prefixes = std::collections::BTreeSet::new();
        for path in &paths {
            let segments: Vec<&str> = path.split('.').collect();
            for end in 1..=segments.len() {
                prefixes.insert(segments[..end].join("."));
            }
        }
        prop_assert_eq!(plan.len(), prefixes.len());
        for (id, node) in plan.nodes().iter().enumerate() {
            if let Some(parent) = node.parent {
                prop_assert!(parent < id);
            }
        }
    }
}
