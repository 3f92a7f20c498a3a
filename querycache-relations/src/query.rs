//! The query handed to relation sources and caller constraints.

use std::fmt;
use std::sync::Arc;

use querycache_core::{QueryCacheResult, Ttl};
use querycache_storage::{CacheOptions, DataSource, QueryCache, RelationContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// Caller-supplied customization of one relation load.
pub type Constraint = Arc<dyn Fn(&mut RelationQuery) + Send + Sync>;

/// Wrap a closure as a [`Constraint`].
pub fn constraint<F>(f: F) -> Constraint
where
    F: Fn(&mut RelationQuery) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Everything needed to run one relation load through the cache.
///
/// The load starts out cached under the caller's base tags plus the tables
/// the relation touches. Constraints may narrow the rows, add tags, or
/// override the TTL before the source runs it.
pub struct RelationQuery {
    relation: String,
    related_table: String,
    scope: Option<String>,
    filters: Vec<(String, Value)>,
    orderings: Vec<(String, Direction)>,
    limit: Option<usize>,
    options: CacheOptions,
    cache: QueryCache,
    source: Arc<dyn DataSource>,
}

impl RelationQuery {
    pub fn new(
        relation: impl Into<String>,
        context: RelationContext,
        base_tags: &[String],
        cache: QueryCache,
        source: Arc<dyn DataSource>,
    ) -> Self {
        Self {
            relation: relation.into(),
            related_table: context.related.clone(),
            scope: None,
            filters: Vec::new(),
            orderings: Vec::new(),
            limit: None,
            options: CacheOptions::new()
                .tags(base_tags.iter().cloned())
                .relation(context),
            cache,
            source,
        }
    }

    pub(crate) fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    /// Keep only related rows whose `column` equals `value`.
    pub fn where_eq(&mut self, column: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn order_by(&mut self, column: impl Into<String>, direction: Direction) -> &mut Self {
        self.orderings.push((column.into(), direction));
        self
    }

    /// Cap the rows of the whole load, not per parent.
    pub fn limit(&mut self, limit: usize) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    /// Also tag the load with `tag`.
    pub fn tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.options.tags.push(tag.into());
        self
    }

    pub fn ttl(&mut self, ttl: impl Into<Ttl>) -> &mut Self {
        self.options.ttl = Some(ttl.into());
        self
    }

    pub fn relation_name(&self) -> &str {
        &self.relation
    }

    pub fn related_table(&self) -> &str {
        &self.related_table
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn filters(&self) -> &[(String, Value)] {
        &self.filters
    }

    pub fn orderings(&self) -> &[(String, Direction)] {
        &self.orderings
    }

    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn cache_options(&self) -> &CacheOptions {
        &self.options
    }

    /// Connection to run the load on. Cached unless caching is disabled.
    pub fn connection(&self) -> QueryCacheResult<Arc<dyn DataSource>> {
        self.cache
            .connection(Arc::clone(&self.source), self.options.clone())
    }
}

impl fmt::Debug for RelationQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationQuery")
            .field("relation", &self.relation)
            .field("related_table", &self.related_table)
            .field("scope", &self.scope)
            .field("filters", &self.filters)
            .field("orderings", &self.orderings)
            .field("limit", &self.limit)
            .field("options", &self.options)
            .finish()
    }
}
