//! Cached relation loading over records.
//!
//! Every relation load runs through the query cache tagged with the
//! caller's base tags plus the tables the relation touches. Without explicit
//! tags a collection is tagged with its table and a single record with its
//! model cache key (`{table}:{key}`).

use std::collections::HashMap;
use std::sync::Arc;

use querycache_core::{InputError, QueryCacheResult, SourceError};
use querycache_storage::{DataSource, QueryCache};

use crate::aggregate::{AggregateFunction, AggregateTarget};
use crate::model::{Record, Relation, RelationKind, Related};
use crate::plan::{LoadPlan, ParsedPath, RelationSpec};
use crate::query::{Constraint, RelationQuery};
use crate::source::RelationSource;

/// Per-table load specifications for the targets of a polymorphic relation.
///
/// Tables without an entry are skipped.
#[derive(Debug, Clone, Default)]
pub struct MorphSpec {
    by_table: HashMap<String, RelationSpec>,
}

impl MorphSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, table: impl Into<String>, spec: impl Into<RelationSpec>) -> Self {
        self.by_table.insert(table.into(), spec.into());
        self
    }

    pub fn get(&self, table: &str) -> Option<&RelationSpec> {
        self.by_table.get(table)
    }
}

/// Whose identity supplies the default base tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagDefault {
    Table,
    ModelKey,
}

/// Loads relations and relation aggregates through the query cache.
#[derive(Clone)]
pub struct RelationLoader {
    cache: QueryCache,
    source: Arc<dyn DataSource>,
    relations: Arc<dyn RelationSource>,
}

impl RelationLoader {
    pub fn new(
        cache: QueryCache,
        source: Arc<dyn DataSource>,
        relations: Arc<dyn RelationSource>,
    ) -> Self {
        Self {
            cache,
            source,
            relations,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    // ------------------------------------------------------------------
    // Relations
    // ------------------------------------------------------------------

    /// Load `spec` for every record.
    pub async fn load_cached(
        &self,
        records: &mut [Record],
        spec: impl Into<RelationSpec>,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        let spec = spec.into();
        let level: Vec<&mut Record> = records.iter_mut().collect();
        self.load_level(level, &spec, tags, TagDefault::Table).await
    }

    /// Load `spec` for one record.
    pub async fn load_record_cached(
        &self,
        record: &mut Record,
        spec: impl Into<RelationSpec>,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        let spec = spec.into();
        self.load_level(vec![record], &spec, tags, TagDefault::ModelKey)
            .await
    }

    /// Load only what is not loaded yet, segment by segment, so partially
    /// loaded trees are topped up rather than reloaded.
    pub async fn load_missing_cached(
        &self,
        records: &mut [Record],
        spec: impl Into<RelationSpec>,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        let spec = spec.into();
        let level: Vec<&mut Record> = records.iter_mut().collect();
        self.load_missing_level(level, &spec, tags, TagDefault::Table)
            .await
    }

    pub async fn load_record_missing_cached(
        &self,
        record: &mut Record,
        spec: impl Into<RelationSpec>,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        let spec = spec.into();
        self.load_missing_level(vec![record], &spec, tags, TagDefault::ModelKey)
            .await
    }

    /// Load a type-specific specification onto the targets of the loaded
    /// polymorphic relation `relation`.
    pub async fn load_morph_cached(
        &self,
        records: &mut [Record],
        relation: &str,
        spec: &MorphSpec,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        let level: Vec<&mut Record> = records.iter_mut().collect();
        let targets = descend(level, &[relation]);

        for (table, group) in group_by(targets, |r| r.table.clone()) {
            let Some(table_spec) = spec.get(&table) else {
                tracing::trace!(relation, table = %table, "No morph specification, skipping");
                continue;
            };
            self.load_level(group, table_spec, tags, TagDefault::Table)
                .await?;
        }
        Ok(())
    }

    async fn load_level(
        &self,
        mut level: Vec<&mut Record>,
        spec: &RelationSpec,
        tags: &[&str],
        default: TagDefault,
    ) -> QueryCacheResult<()> {
        if level.is_empty() || spec.is_empty() {
            return Ok(());
        }
        let plan = LoadPlan::parse(spec)?;
        let tags = base_tags(&level, tags, default);

        for id in 0..plan.len() {
            let node = plan.node(id);
            let lineage = plan.lineage(id);
            let parents = descend(reborrow(&mut level), &lineage[..lineage.len() - 1]);
            self.load_relation(
                parents,
                &node.name,
                node.scope.clone(),
                node.constraint.clone(),
                &tags,
            )
            .await?;
        }
        Ok(())
    }

    async fn load_missing_level(
        &self,
        mut level: Vec<&mut Record>,
        spec: &RelationSpec,
        tags: &[&str],
        default: TagDefault,
    ) -> QueryCacheResult<()> {
        if level.is_empty() || spec.is_empty() {
            return Ok(());
        }
        let tags = base_tags(&level, tags, default);

        for entry in spec.entries() {
            let path = ParsedPath::parse(entry)?;
            let last = path.segments.len() - 1;

            for (depth, segment) in path.segments.iter().enumerate() {
                let ancestors: Vec<&str> = path.segments[..depth].iter().map(String::as_str).collect();
                let missing: Vec<&mut Record> = descend(reborrow(&mut level), &ancestors)
                    .into_iter()
                    .filter(|r| !r.relation_loaded(segment))
                    .collect();

                let (scope, constraint) = if depth == last {
                    (path.scope.clone(), path.constraint.clone())
                } else {
                    (None, None)
                };
                self.load_relation(missing, segment, scope, constraint, &tags)
                    .await?;
            }
        }
        Ok(())
    }

    async fn load_relation(
        &self,
        parents: Vec<&mut Record>,
        name: &str,
        scope: Option<String>,
        constraint: Option<Constraint>,
        tags: &[String],
    ) -> QueryCacheResult<()> {
        for (table, group) in group_by(parents, |r| r.table.clone()) {
            let relation = self.relations.relation(&table, name)?;
            match &relation.kind {
                RelationKind::MorphTo { type_column, .. } => {
                    let type_column = type_column.clone();
                    let by_type = group_by(group, |r| {
                        r.get(&type_column)
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                    });
                    for (target, records) in by_type {
                        match target {
                            Some(target) => {
                                self.load_group(
                                    &relation.resolved_to(&target),
                                    records,
                                    scope.clone(),
                                    constraint.clone(),
                                    tags,
                                )
                                .await?
                            }
                            None => {
                                for record in records {
                                    record.set_relation(relation.name.as_str(), Related::One(None));
                                }
                            }
                        }
                    }
                }
                _ => {
                    self.load_group(&relation, group, scope.clone(), constraint.clone(), tags)
                        .await?
                }
            }
        }
        Ok(())
    }

    async fn load_group(
        &self,
        relation: &Relation,
        mut group: Vec<&mut Record>,
        scope: Option<String>,
        constraint: Option<Constraint>,
        tags: &[String],
    ) -> QueryCacheResult<()> {
        let query = self.query_for(relation, scope, constraint, tags);
        let loaded = {
            let parents: Vec<&Record> = group.iter().map(|r| &**r).collect();
            self.relations.eager_load(relation, &parents, &query).await?
        };
        check_aligned(relation, group.len(), loaded.len())?;

        tracing::debug!(
            relation = %relation.name,
            parent = %relation.parent_table,
            related = %relation.related_table,
            parents = group.len(),
            "Loaded relation"
        );
        for (record, related) in group.iter_mut().zip(loaded) {
            record.set_relation(relation.name.as_str(), related);
        }
        Ok(())
    }

    fn query_for(
        &self,
        relation: &Relation,
        scope: Option<String>,
        constraint: Option<Constraint>,
        tags: &[String],
    ) -> RelationQuery {
        let mut query = RelationQuery::new(
            relation.name.as_str(),
            relation.context(),
            tags,
            self.cache.clone(),
            Arc::clone(&self.source),
        )
        .with_scope(scope);
        if let Some(constraint) = constraint {
            constraint(&mut query);
        }
        query
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    /// Store an aggregate of each relation in `relations` on every record.
    ///
    /// Entries are relation names, optionally `"name as alias"`; nested
    /// paths are rejected.
    pub async fn load_aggregate_cached(
        &self,
        records: &mut [Record],
        relations: impl Into<RelationSpec>,
        column: Option<&str>,
        function: AggregateFunction,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        let spec = relations.into();
        let level: Vec<&mut Record> = records.iter_mut().collect();
        self.aggregate_level(level, &spec, column, function, tags, TagDefault::Table)
            .await
    }

    pub async fn load_record_aggregate_cached(
        &self,
        record: &mut Record,
        relations: impl Into<RelationSpec>,
        column: Option<&str>,
        function: AggregateFunction,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        let spec = relations.into();
        self.aggregate_level(vec![record], &spec, column, function, tags, TagDefault::ModelKey)
            .await
    }

    pub async fn load_count_cached(
        &self,
        records: &mut [Record],
        relations: impl Into<RelationSpec>,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        self.load_aggregate_cached(records, relations, None, AggregateFunction::Count, tags)
            .await
    }

    pub async fn load_record_count_cached(
        &self,
        record: &mut Record,
        relations: impl Into<RelationSpec>,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        self.load_record_aggregate_cached(record, relations, None, AggregateFunction::Count, tags)
            .await
    }

    pub async fn load_sum_cached(
        &self,
        records: &mut [Record],
        relations: impl Into<RelationSpec>,
        column: &str,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        self.load_aggregate_cached(records, relations, Some(column), AggregateFunction::Sum, tags)
            .await
    }

    pub async fn load_min_cached(
        &self,
        records: &mut [Record],
        relations: impl Into<RelationSpec>,
        column: &str,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        self.load_aggregate_cached(records, relations, Some(column), AggregateFunction::Min, tags)
            .await
    }

    pub async fn load_max_cached(
        &self,
        records: &mut [Record],
        relations: impl Into<RelationSpec>,
        column: &str,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        self.load_aggregate_cached(records, relations, Some(column), AggregateFunction::Max, tags)
            .await
    }

    pub async fn load_avg_cached(
        &self,
        records: &mut [Record],
        relations: impl Into<RelationSpec>,
        column: &str,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        self.load_aggregate_cached(records, relations, Some(column), AggregateFunction::Avg, tags)
            .await
    }

    pub async fn load_exists_cached(
        &self,
        records: &mut [Record],
        relations: impl Into<RelationSpec>,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        self.load_aggregate_cached(records, relations, None, AggregateFunction::Exists, tags)
            .await
    }

    /// Aggregates on the targets of the loaded polymorphic relation
    /// `relation`, with relations chosen per target table.
    pub async fn load_morph_aggregate_cached(
        &self,
        records: &mut [Record],
        relation: &str,
        spec: &MorphSpec,
        column: Option<&str>,
        function: AggregateFunction,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        let level: Vec<&mut Record> = records.iter_mut().collect();
        let targets = descend(level, &[relation]);

        for (table, group) in group_by(targets, |r| r.table.clone()) {
            let Some(table_spec) = spec.get(&table) else {
                continue;
            };
            self.aggregate_level(group, table_spec, column, function, tags, TagDefault::Table)
                .await?;
        }
        Ok(())
    }

    pub async fn load_morph_count_cached(
        &self,
        records: &mut [Record],
        relation: &str,
        spec: &MorphSpec,
        tags: &[&str],
    ) -> QueryCacheResult<()> {
        self.load_morph_aggregate_cached(records, relation, spec, None, AggregateFunction::Count, tags)
            .await
    }

    async fn aggregate_level(
        &self,
        level: Vec<&mut Record>,
        spec: &RelationSpec,
        column: Option<&str>,
        function: AggregateFunction,
        tags: &[&str],
        default: TagDefault,
    ) -> QueryCacheResult<()> {
        if level.is_empty() || spec.is_empty() {
            return Ok(());
        }
        let tags = base_tags(&level, tags, default);
        let targets = spec
            .entries()
            .iter()
            .map(|entry| {
                AggregateTarget::parse(&entry.path, function, column)
                    .map(|target| (target, entry.constraint.clone()))
            })
            .collect::<QueryCacheResult<Vec<_>>>()?;

        for (table, mut group) in group_by(level, |r| r.table.clone()) {
            for (target, constraint) in &targets {
                let relation = self.relations.relation(&table, &target.relation)?;
                if relation.is_morph() {
                    return Err(InputError::UnsupportedAggregate {
                        relation: relation.name.clone(),
                        function: format!("{function} over a polymorphic relation"),
                    }
                    .into());
                }

                let query = self.query_for(&relation, None, constraint.clone(), &tags);
                let values = {
                    let parents: Vec<&Record> = group.iter().map(|r| &**r).collect();
                    self.relations
                        .aggregate(&relation, &parents, column, function, &query)
                        .await?
                };
                check_aligned(&relation, group.len(), values.len())?;

                for (record, value) in group.iter_mut().zip(values) {
                    record.set(target.alias.as_str(), value);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RelationLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationLoader")
            .field("cache", &self.cache)
            .field("source", &self.source.identity())
            .finish()
    }
}

fn base_tags(level: &[&mut Record], tags: &[&str], default: TagDefault) -> Vec<String> {
    if !tags.is_empty() {
        return tags.iter().map(|t| t.to_string()).collect();
    }
    match (level.first(), default) {
        (Some(first), TagDefault::Table) => vec![first.table.clone()],
        (Some(first), TagDefault::ModelKey) => vec![first.identity().model_cache_key()],
        (None, _) => Vec::new(),
    }
}

fn check_aligned(relation: &Relation, expected: usize, actual: usize) -> QueryCacheResult<()> {
    if expected != actual {
        return Err(SourceError::MalformedResult {
            source_name: relation.name.clone(),
            reason: format!("expected {expected} results for {expected} parents, got {actual}"),
        }
        .into());
    }
    Ok(())
}

fn reborrow<'a>(level: &'a mut [&mut Record]) -> Vec<&'a mut Record> {
    level.iter_mut().map(|r| &mut **r).collect()
}

/// Records reached by following `names` from `level`.
fn descend<'a>(level: Vec<&'a mut Record>, names: &[&str]) -> Vec<&'a mut Record> {
    names.iter().fold(level, |level, name| {
        level
            .into_iter()
            .flat_map(|record| record.related_mut(name))
            .collect()
    })
}

/// Group records by `key`, keeping first-seen order.
fn group_by<'a, K, F>(level: Vec<&'a mut Record>, key: F) -> Vec<(K, Vec<&'a mut Record>)>
where
    K: PartialEq,
    F: Fn(&Record) -> K,
{
    let mut groups: Vec<(K, Vec<&'a mut Record>)> = Vec::new();
    for record in level {
        let k = key(&*record);
        match groups.iter_mut().find(|(existing, _)| *existing == k) {
            Some((_, group)) => group.push(record),
            None => groups.push((k, vec![record])),
        }
    }
    groups
}
