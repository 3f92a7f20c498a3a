//! Query Cache Test Utilities
//!
//! Shared test infrastructure for the query cache workspace:
//! - An in-memory database usable as both a data source and a relation source
//! - Test fixtures for a small blog schema
//! - Proptest generators for tags, relation paths and configurations

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use querycache_core::{
    EntityIdentity, QueryCacheConfig, QueryCacheError, QueryCacheResult, ResultSet, Row,
    SourceError, Tag,
};
pub use querycache_relations::{
    render_key, AggregateFunction, Direction, Record, Related, Relation, RelationKind,
    RelationQuery, RelationSource,
};
pub use querycache_storage::{
    CacheOptions, CacheStore, DataSource, InMemoryCacheStore, QueryCache, StoreRegistry,
};

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MEMORY QUERIES
// ============================================================================

/// Row filter understood by [`MemoryDatabase`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Eq { column: String, value: Value },
    In { column: String, values: Vec<Value> },
}

impl Filter {
    fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq { column, value } => row.get(column).is_some_and(|v| same_key(v, value)),
            Filter::In { column, values } => row
                .get(column)
                .is_some_and(|v| values.iter().any(|candidate| same_key(v, candidate))),
        }
    }
}

/// A read against [`MemoryDatabase`], sent as JSON query text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub table: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub order_by: Vec<(String, Direction)>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Turns the read into one `{group, aggregate}` row per group.
    #[serde(default)]
    pub aggregate: Option<MemoryAggregate>,
}

/// Grouped aggregate applied after filtering, ordering and limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryAggregate {
    pub function: AggregateFunction,
    #[serde(default)]
    pub column: Option<String>,
    /// Column whose value names the group.
    pub group_by: String,
    /// Group through another table instead of by `group_by` directly.
    #[serde(default)]
    pub through: Option<MemoryJoin>,
}

/// Join used by a grouped aggregate: a row belongs to the `group_by` value
/// of every live row of `table` whose `key` equals the row's own
/// `group_by` column and which passes `filters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryJoin {
    pub table: String,
    pub key: String,
    pub group_by: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl MemoryQuery {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn where_in(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.push(Filter::In {
            column: column.into(),
            values,
        });
        self
    }

    pub fn scope(mut self, scope: Option<&str>) -> Self {
        self.scope = scope.map(str::to_string);
        self
    }

    /// Apply the filters, ordering and limit a relation query carries.
    pub fn constrained_by(mut self, query: &RelationQuery) -> Self {
        for (column, value) in query.filters() {
            self = self.where_eq(column.as_str(), value.clone());
        }
        self.order_by.extend(query.orderings().iter().cloned());
        self.limit = query.row_limit();
        self.scope(query.scope())
    }

    /// Aggregate the matching rows per distinct `group_by` value.
    pub fn aggregate(
        mut self,
        function: AggregateFunction,
        column: Option<&str>,
        group_by: impl Into<String>,
    ) -> Self {
        self.aggregate = Some(MemoryAggregate {
            function,
            column: column.map(str::to_string),
            group_by: group_by.into(),
            through: None,
        });
        self
    }

    /// Group an aggregate through `join` instead of by its own column.
    pub fn through(mut self, join: MemoryJoin) -> Self {
        if let Some(aggregate) = self.aggregate.as_mut() {
            aggregate.through = Some(join);
        }
        self
    }

    /// Query text for [`DataSource::select`].
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A write against [`MemoryDatabase`], sent as JSON statement text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MemoryStatement {
    Insert { table: String, row: Row },
    Update { table: String, filters: Vec<Filter>, set: Row },
    Delete { table: String, filters: Vec<Filter> },
}

impl MemoryStatement {
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Keys compare by rendering, so `7` matches `"7"`.
fn same_key(a: &Value, b: &Value) -> bool {
    a == b || render_key(Some(a)) == render_key(Some(b))
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering as O;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(O::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => O::Equal,
        (None | Some(Value::Null), _) => O::Less,
        (_, None | Some(Value::Null)) => O::Greater,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

// ============================================================================
// MEMORY DATABASE
// ============================================================================

/// In-memory tables with relation definitions.
///
/// Reads are JSON-encoded [`MemoryQuery`] values and writes JSON-encoded
/// [`MemoryStatement`] values. Rows with a non-null `deleted_at` are hidden
/// unless the query scope is `withTrashed` (or `onlyTrashed`). Every
/// executed read is counted.
pub struct MemoryDatabase {
    name: String,
    tables: RwLock<HashMap<String, Vec<Row>>>,
    relations: HashMap<(String, String), Relation>,
    selects: AtomicUsize,
    statements: AtomicUsize,
    latency: Option<Duration>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(HashMap::new()),
            relations: HashMap::new(),
            selects: AtomicUsize::new(0),
            statements: AtomicUsize::new(0),
            latency: None,
        }
    }

    /// Sleep this long in every read, to widen race windows.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations
            .insert((relation.parent_table.clone(), relation.name.clone()), relation);
        self
    }

    pub fn with_rows(self, table: &str, rows: Vec<Value>) -> Self {
        for row in rows {
            self.insert(table, row);
        }
        self
    }

    pub fn insert(&self, table: &str, row: Value) {
        if let Value::Object(row) = row {
            self.tables
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(table.to_string())
                .or_default()
                .push(row);
        }
    }

    /// Live rows of `table` as records.
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| is_live(row))
                    .map(|row| Record::new(table, row.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of reads executed so far.
    pub fn select_count(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    pub fn statement_count(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }

    pub fn reset_counts(&self) {
        self.selects.store(0, Ordering::SeqCst);
        self.statements.store(0, Ordering::SeqCst);
    }

    fn run_query(&self, query: &MemoryQuery) -> QueryCacheResult<ResultSet> {
        let trashed = match query.scope.as_deref() {
            None => Some(false),
            Some("withTrashed") => None,
            Some("onlyTrashed") => Some(true),
            Some(other) => return Err(self.failure(format!("unknown scope {other}"))),
        };

        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let rows = tables
            .get(&query.table)
            .ok_or_else(|| self.failure(format!("no such table {}", query.table)))?;

        let mut result: ResultSet = rows
            .iter()
            .filter(|row| trashed.map_or(true, |trashed| is_live(row) != trashed))
            .filter(|row| query.filters.iter().all(|f| f.matches(row)))
            .cloned()
            .collect();

        for (column, direction) in query.order_by.iter().rev() {
            result.sort_by(|a, b| {
                let ordering = compare(a.get(column), b.get(column));
                match direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }

        match &query.aggregate {
            Some(aggregate) => self.group(&tables, &query.table, result, aggregate),
            None => Ok(result),
        }
    }

    fn group(
        &self,
        tables: &HashMap<String, Vec<Row>>,
        table: &str,
        rows: ResultSet,
        aggregate: &MemoryAggregate,
    ) -> QueryCacheResult<ResultSet> {
        let joined: Option<(&MemoryJoin, Vec<&Row>)> = match &aggregate.through {
            Some(join) => {
                let rows = tables
                    .get(&join.table)
                    .ok_or_else(|| self.failure(format!("no such table {}", join.table)))?;
                let live = rows
                    .iter()
                    .filter(|row| is_live(row))
                    .filter(|row| join.filters.iter().all(|f| f.matches(row)))
                    .collect();
                Some((join, live))
            }
            None => None,
        };

        let mut groups: Vec<(Value, Vec<Record>)> = Vec::new();
        for row in rows {
            let Some(own) = row.get(&aggregate.group_by).filter(|v| !v.is_null()) else {
                continue;
            };
            let keys: Vec<Value> = match &joined {
                Some((join, through)) => through
                    .iter()
                    .filter(|t| t.get(&join.key).is_some_and(|k| same_key(k, own)))
                    .filter_map(|t| t.get(&join.group_by).cloned())
                    .fold(Vec::new(), |mut keys, key| {
                        if !keys.iter().any(|k| same_key(k, &key)) {
                            keys.push(key);
                        }
                        keys
                    }),
                None => vec![own.clone()],
            };

            let record = Record::new(table, row.clone());
            for key in keys {
                match groups.iter_mut().find(|(group, _)| same_key(group, &key)) {
                    Some((_, members)) => members.push(record.clone()),
                    None => groups.push((key, vec![record.clone()])),
                }
            }
        }

        Ok(groups
            .into_iter()
            .map(|(key, members)| {
                let refs: Vec<&Record> = members.iter().collect();
                let mut row = Row::new();
                row.insert("group".to_string(), key);
                row.insert(
                    "aggregate".to_string(),
                    aggregate.function.apply(&refs, aggregate.column.as_deref()),
                );
                row
            })
            .collect())
    }

    fn run_statement(&self, statement: MemoryStatement) -> u64 {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        match statement {
            MemoryStatement::Insert { table, row } => {
                tables.entry(table).or_default().push(row);
                1
            }
            MemoryStatement::Update {
                table,
                filters,
                set,
            } => {
                let mut affected = 0;
                for row in tables.entry(table).or_default().iter_mut() {
                    if filters.iter().all(|f| f.matches(row)) {
                        row.extend(set.clone());
                        affected += 1;
                    }
                }
                affected
            }
            MemoryStatement::Delete { table, filters } => {
                let rows = tables.entry(table).or_default();
                let before = rows.len();
                rows.retain(|row| !filters.iter().all(|f| f.matches(row)));
                (before - rows.len()) as u64
            }
        }
    }

    fn failure(&self, reason: String) -> QueryCacheError {
        SourceError::QueryFailed {
            source_name: self.name.clone(),
            reason,
        }
        .into()
    }

    async fn fetch(
        &self,
        connection: &Arc<dyn DataSource>,
        query: MemoryQuery,
    ) -> QueryCacheResult<Vec<Record>> {
        let table = query.table.clone();
        let rows = connection.select(&query.to_text(), &[]).await?;
        Ok(rows.into_iter().map(|row| Record::new(table.as_str(), row)).collect())
    }
}

fn is_live(row: &Row) -> bool {
    row.get("deleted_at").map_or(true, Value::is_null)
}

fn column_values(parents: &[&Record], column: &str) -> Vec<Value> {
    let mut values: Vec<Value> = Vec::new();
    for value in parents.iter().filter_map(|p| p.get(column)) {
        if !values.iter().any(|v| same_key(v, value)) {
            values.push(value.clone());
        }
    }
    values
}

fn matching<'a>(records: &'a [Record], column: &str, value: Option<&Value>) -> Vec<&'a Record> {
    match value {
        Some(value) => records
            .iter()
            .filter(|r| r.get(column).is_some_and(|v| same_key(v, value)))
            .collect(),
        None => Vec::new(),
    }
}

#[async_trait]
impl DataSource for MemoryDatabase {
    fn identity(&self) -> &str {
        &self.name
    }

    async fn select(&self, query: &str, _bindings: &[Value]) -> QueryCacheResult<ResultSet> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let query: MemoryQuery = serde_json::from_str(query)
            .map_err(|e| self.failure(format!("malformed query: {e}")))?;
        self.run_query(&query)
    }

    async fn statement(&self, query: &str, _bindings: &[Value]) -> QueryCacheResult<u64> {
        self.statements.fetch_add(1, Ordering::SeqCst);
        let statement: MemoryStatement = serde_json::from_str(query)
            .map_err(|e| self.failure(format!("malformed statement: {e}")))?;
        Ok(self.run_statement(statement))
    }
}

#[async_trait]
impl RelationSource for MemoryDatabase {
    fn relation(&self, table: &str, name: &str) -> QueryCacheResult<Relation> {
        self.relations
            .get(&(table.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| querycache_relations::unknown_relation(table, name))
    }

    async fn eager_load(
        &self,
        relation: &Relation,
        parents: &[&Record],
        query: &RelationQuery,
    ) -> QueryCacheResult<Vec<Related>> {
        let connection = query.connection()?;
        let related_table = query.related_table().to_string();

        match &relation.kind {
            RelationKind::HasMany {
                foreign_key,
                local_key,
            }
            | RelationKind::HasOne {
                foreign_key,
                local_key,
            } => {
                let keys = column_values(parents, local_key);
                let related = self
                    .fetch(
                        &connection,
                        MemoryQuery::table(related_table)
                            .where_in(foreign_key.as_str(), keys)
                            .constrained_by(query),
                    )
                    .await?;
                let one = matches!(relation.kind, RelationKind::HasOne { .. });
                Ok(parents
                    .iter()
                    .map(|parent| {
                        let found = matching(&related, foreign_key, parent.get(local_key));
                        if one {
                            Related::One(found.first().map(|r| Box::new((*r).clone())))
                        } else {
                            Related::Many(found.into_iter().cloned().collect())
                        }
                    })
                    .collect())
            }
            RelationKind::BelongsTo {
                foreign_key,
                owner_key,
            } => {
                let keys = column_values(parents, foreign_key);
                let related = self
                    .fetch(
                        &connection,
                        MemoryQuery::table(related_table)
                            .where_in(owner_key.as_str(), keys)
                            .constrained_by(query),
                    )
                    .await?;
                Ok(parents
                    .iter()
                    .map(|parent| {
                        let found = matching(&related, owner_key, parent.get(foreign_key));
                        Related::One(found.first().map(|r| Box::new((*r).clone())))
                    })
                    .collect())
            }
            RelationKind::HasManyThrough {
                through_table,
                first_key,
                second_key,
                local_key,
                second_local_key,
            } => {
                let keys = column_values(parents, local_key);
                let through = self
                    .fetch(
                        &connection,
                        MemoryQuery::table(through_table.as_str()).where_in(first_key.as_str(), keys),
                    )
                    .await?;
                let through_refs: Vec<&Record> = through.iter().collect();
                let through_keys = column_values(&through_refs, second_local_key);
                let related = self
                    .fetch(
                        &connection,
                        MemoryQuery::table(related_table)
                            .where_in(second_key.as_str(), through_keys)
                            .constrained_by(query),
                    )
                    .await?;

                Ok(parents
                    .iter()
                    .map(|parent| {
                        let hops = matching(&through, first_key, parent.get(local_key));
                        let records = related
                            .iter()
                            .filter(|r| {
                                hops.iter().any(|hop| match (r.get(second_key), hop.get(second_local_key)) {
                                    (Some(a), Some(b)) => same_key(a, b),
                                    _ => false,
                                })
                            })
                            .cloned()
                            .collect();
                        Related::Many(records)
                    })
                    .collect())
            }
            RelationKind::MorphTo { id_column, .. } => {
                let keys = column_values(parents, id_column);
                let related = self
                    .fetch(
                        &connection,
                        MemoryQuery::table(related_table)
                            .where_in("id", keys)
                            .constrained_by(query),
                    )
                    .await?;
                Ok(parents
                    .iter()
                    .map(|parent| {
                        let found = matching(&related, "id", parent.get(id_column));
                        Related::One(found.first().map(|r| Box::new((*r).clone())))
                    })
                    .collect())
            }
        }
    }

    async fn aggregate(
        &self,
        relation: &Relation,
        parents: &[&Record],
        column: Option<&str>,
        function: AggregateFunction,
        query: &RelationQuery,
    ) -> QueryCacheResult<Vec<Value>> {
        querycache_relations::require_column(relation, column, function)?;
        let connection = query.connection()?;
        let related = MemoryQuery::table(query.related_table());

        let (grouped, parent_key) = match &relation.kind {
            RelationKind::HasMany {
                foreign_key,
                local_key,
            }
            | RelationKind::HasOne {
                foreign_key,
                local_key,
            } => (
                related
                    .where_in(foreign_key.as_str(), column_values(parents, local_key))
                    .constrained_by(query)
                    .aggregate(function, column, foreign_key.as_str()),
                local_key,
            ),
            RelationKind::BelongsTo {
                foreign_key,
                owner_key,
            } => (
                related
                    .where_in(owner_key.as_str(), column_values(parents, foreign_key))
                    .constrained_by(query)
                    .aggregate(function, column, owner_key.as_str()),
                foreign_key,
            ),
            RelationKind::HasManyThrough {
                through_table,
                first_key,
                second_key,
                local_key,
                second_local_key,
            } => (
                related
                    .constrained_by(query)
                    .aggregate(function, column, second_key.as_str())
                    .through(MemoryJoin {
                        table: through_table.clone(),
                        key: second_local_key.clone(),
                        group_by: first_key.clone(),
                        filters: vec![Filter::In {
                            column: first_key.clone(),
                            values: column_values(parents, local_key),
                        }],
                    }),
                local_key,
            ),
            RelationKind::MorphTo { id_column, .. } => (
                related
                    .where_in("id", column_values(parents, id_column))
                    .constrained_by(query)
                    .aggregate(function, column, "id"),
                id_column,
            ),
        };

        let groups = connection.select(&grouped.to_text(), &[]).await?;
        Ok(parents
            .iter()
            .map(|parent| {
                parent
                    .get(parent_key)
                    .filter(|key| !key.is_null())
                    .and_then(|key| {
                        groups
                            .iter()
                            .find(|row| row.get("group").is_some_and(|g| same_key(g, key)))
                    })
                    .and_then(|row| row.get("aggregate").cloned())
                    .unwrap_or_else(|| function.apply(&[], column))
            })
            .collect())
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.name)
            .field("relations", &self.relations.len())
            .field("selects", &self.select_count())
            .finish()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for query cache inputs.

    use super::*;
    use proptest::prelude::*;

    /// A valid tag name.
    pub fn arb_tag_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    pub fn arb_tag() -> impl Strategy<Value = Tag> {
        arb_tag_name().prop_map(|name| Tag::new(name).unwrap())
    }

    /// One to four distinct tag names.
    pub fn arb_tag_names() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::btree_set(arb_tag_name(), 1..5)
            .prop_map(|names| names.into_iter().collect())
    }

    /// A dotted relation path of one to three segments.
    pub fn arb_relation_path() -> impl Strategy<Value = String> {
        proptest::collection::vec("[a-d]", 1..4).prop_map(|segments| segments.join("."))
    }

    pub fn arb_entity_identity() -> impl Strategy<Value = EntityIdentity> {
        ("[a-z]{1,8}", 1u32..10_000, proptest::option::of("[a-z0-9-]{1,12}")).prop_map(
            |(table, key, route)| {
                let identity = EntityIdentity::new(table, key.to_string());
                match route {
                    Some(route) => identity.with_route_key(route),
                    None => identity,
                }
            },
        )
    }

    /// A configuration that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = QueryCacheConfig> {
        (any::<bool>(), "[a-z]{1,6}", 0u64..30, 1u64..86_400).prop_map(
            |(enable, prefix, lock_wait, ttl)| {
                QueryCacheConfig::default()
                    .with_enable(enable)
                    .with_prefix(prefix)
                    .with_lock_wait(Duration::from_secs(lock_wait))
                    .with_ttl(Duration::from_secs(ttl))
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! A small blog schema with users, posts, comments, videos, podcasts and
    //! polymorphic images.

    use super::*;
    use serde_json::json;

    /// Cache over a fresh in-memory store, returned alongside the store.
    pub fn memory_cache(config: QueryCacheConfig) -> (QueryCache, Arc<InMemoryCacheStore>) {
        let store = Arc::new(InMemoryCacheStore::new("memory"));
        let registry = StoreRegistry::single("memory", store.clone() as Arc<dyn CacheStore>);
        let cache = QueryCache::new(config, registry).expect("memory cache configuration");
        (cache, store)
    }

    /// The blog database.
    ///
    /// Post 1 has three live comments (votes 3, 1, 5) and one trashed;
    /// post 2 has one; post 3 has none. Users 1 and 2 live in country 1,
    /// user 3 in country 2. Images point at posts, videos and podcasts.
    pub fn blog() -> MemoryDatabase {
        MemoryDatabase::new("blog")
            .with_rows(
                "countries",
                vec![json!({"id": 1, "name": "uk"}), json!({"id": 2, "name": "us"})],
            )
            .with_rows(
                "users",
                vec![
                    json!({"id": 1, "name": "ada", "country_id": 1}),
                    json!({"id": 2, "name": "linus", "country_id": 1}),
                    json!({"id": 3, "name": "grace", "country_id": 2}),
                ],
            )
            .with_rows(
                "posts",
                vec![
                    json!({"id": 1, "user_id": 1, "title": "Hello", "slug": "hello"}),
                    json!({"id": 2, "user_id": 2, "title": "Kernels", "slug": "kernels"}),
                    json!({"id": 3, "user_id": 3, "title": "Compilers", "slug": "compilers"}),
                ],
            )
            .with_rows(
                "comments",
                vec![
                    json!({"id": 1, "post_id": 1, "user_id": 2, "votes": 3, "deleted_at": null}),
                    json!({"id": 2, "post_id": 1, "user_id": 3, "votes": 1, "deleted_at": null}),
                    json!({"id": 3, "post_id": 1, "user_id": 1, "votes": 5, "deleted_at": null}),
                    json!({"id": 4, "post_id": 1, "user_id": 2, "votes": 10, "deleted_at": "2024-01-01T00:00:00Z"}),
                    json!({"id": 5, "post_id": 2, "user_id": 1, "votes": 2, "deleted_at": null}),
                ],
            )
            .with_rows("videos", vec![json!({"id": 1, "user_id": 3, "title": "Intro"})])
            .with_rows("podcasts", vec![json!({"id": 1, "title": "Pod"})])
            .with_rows(
                "images",
                vec![
                    json!({"id": 1, "imageable_type": "posts", "imageable_id": 1}),
                    json!({"id": 2, "imageable_type": "videos", "imageable_id": 1}),
                    json!({"id": 3, "imageable_type": "podcasts", "imageable_id": 1}),
                    json!({"id": 4, "imageable_type": "posts", "imageable_id": 2}),
                ],
            )
            .with_relation(Relation::has_many("comments", "posts", "comments", "post_id"))
            .with_relation(Relation::belongs_to("author", "posts", "users", "user_id"))
            .with_relation(Relation::belongs_to("author", "comments", "users", "user_id"))
            .with_relation(Relation::belongs_to("post", "comments", "posts", "post_id"))
            .with_relation(Relation::has_many("posts", "users", "posts", "user_id"))
            .with_relation(Relation::belongs_to("country", "users", "countries", "country_id"))
            .with_relation(Relation::has_many_through(
                "posts",
                "countries",
                "posts",
                "users",
                "country_id",
                "user_id",
            ))
            .with_relation(Relation::belongs_to("author", "videos", "users", "user_id"))
            .with_relation(Relation::morph_to(
                "imageable",
                "images",
                "imageable_type",
                "imageable_id",
            ))
    }

    pub fn posts(db: &MemoryDatabase) -> Vec<Record> {
        db.records("posts")
            .into_iter()
            .map(|r| r.with_route_key_name("slug"))
            .collect()
    }
}
