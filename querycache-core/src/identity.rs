//! Entity identity and the tags derived from it.

use crate::{QueryCacheResult, Tag};
use serde::{Deserialize, Serialize};

/// Identity of a persisted entity, as far as cache invalidation cares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityIdentity {
    /// Table (or collection) the entity lives in.
    pub table: String,
    /// Primary key rendered as a string.
    pub key: String,
    /// Route/alias key. Often equal to the primary key.
    pub route_key: String,
}

impl EntityIdentity {
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            table: table.into(),
            route_key: key.clone(),
            key,
        }
    }

    pub fn with_route_key(mut self, route_key: impl Into<String>) -> Self {
        self.route_key = route_key.into();
        self
    }

    /// Tags that every cached read touching this entity may carry:
    /// the table, `{table}_{route_key}` and `{table}_{key}`.
    ///
    /// When the route key equals the primary key the last two coincide and
    /// only one is returned.
    pub fn cache_tags(&self) -> QueryCacheResult<Vec<Tag>> {
        let mut tags = vec![
            Tag::new(self.table.as_str())?,
            Tag::new(format!("{}_{}", self.table, self.route_key))?,
        ];
        let key_tag = Tag::new(format!("{}_{}", self.table, self.key))?;
        if !tags.contains(&key_tag) {
            tags.push(key_tag);
        }
        Ok(tags)
    }

    /// Per-entity cache tag `{table}:{key}`, used as the default base tag
    /// when loading relations for a single entity.
    pub fn model_cache_key(&self) -> String {
        format!("{}:{}", self.table, self.key)
    }
}
