//! The seam between the loader and whatever knows the schema.

use async_trait::async_trait;
use querycache_core::{InputError, QueryCacheResult};
use serde_json::Value;

use crate::aggregate::AggregateFunction;
use crate::model::{Record, Related, Relation};
use crate::query::RelationQuery;

/// Resolves relation definitions and runs relation loads.
///
/// Loads must execute on `query.connection()` so they go through the
/// cache with the tags the loader prepared.
#[async_trait]
pub trait RelationSource: Send + Sync {
    /// Definition of relation `name` on `table`.
    fn relation(&self, table: &str, name: &str) -> QueryCacheResult<Relation>;

    /// Load `relation` for every parent. The result is aligned with
    /// `parents`.
    async fn eager_load(
        &self,
        relation: &Relation,
        parents: &[&Record],
        query: &RelationQuery,
    ) -> QueryCacheResult<Vec<Related>>;

    /// One aggregate value per parent, aligned with `parents`.
    ///
    /// Sources should run this as a single grouped query on
    /// `query.connection()` so only the scalars are cached. The default is
    /// a fallback for sources that cannot: it eager-loads the related
    /// records, which caches the full rows, and folds them in memory.
    async fn aggregate(
        &self,
        relation: &Relation,
        parents: &[&Record],
        column: Option<&str>,
        function: AggregateFunction,
        query: &RelationQuery,
    ) -> QueryCacheResult<Vec<Value>> {
        require_column(relation, column, function)?;

        let loaded = self.eager_load(relation, parents, query).await?;
        Ok(loaded
            .iter()
            .map(|related| function.apply(&related.records(), column))
            .collect())
    }
}

/// Reject column aggregates requested without a column.
pub fn require_column(
    relation: &Relation,
    column: Option<&str>,
    function: AggregateFunction,
) -> QueryCacheResult<()> {
    if function.needs_column() && column.is_none() {
        return Err(InputError::UnsupportedAggregate {
            relation: relation.name.clone(),
            function: format!("{function} without a column"),
        }
        .into());
    }
    Ok(())
}

/// Error for relations the source does not define.
pub fn unknown_relation(table: &str, name: &str) -> querycache_core::QueryCacheError {
    InputError::UnknownRelation {
        table: table.to_string(),
        relation: name.to_string(),
    }
    .into()
}
