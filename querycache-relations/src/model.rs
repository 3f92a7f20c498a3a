//! Records, relations and their definitions.

use std::collections::BTreeMap;

use querycache_core::{EntityIdentity, Row};
use querycache_storage::RelationContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row of some table together with any relations loaded onto it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub table: String,
    /// Primary key column.
    pub key_name: String,
    /// Route key column, when it differs from the primary key.
    #[serde(default)]
    pub route_key_name: Option<String>,
    pub attributes: Row,
    #[serde(default)]
    pub relations: BTreeMap<String, Related>,
}

impl Record {
    pub fn new(table: impl Into<String>, attributes: Row) -> Self {
        Self {
            table: table.into(),
            key_name: "id".to_string(),
            route_key_name: None,
            attributes,
            relations: BTreeMap::new(),
        }
    }

    pub fn with_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = key_name.into();
        self
    }

    pub fn with_route_key_name(mut self, route_key_name: impl Into<String>) -> Self {
        self.route_key_name = Some(route_key_name.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.attributes.get(column).filter(|v| !v.is_null())
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.attributes.insert(column.into(), value);
    }

    pub fn key(&self) -> Option<&Value> {
        self.get(&self.key_name)
    }

    /// The identity used for cache tags.
    pub fn identity(&self) -> EntityIdentity {
        let identity = EntityIdentity::new(self.table.as_str(), render_key(self.key()));
        match &self.route_key_name {
            Some(column) => identity.with_route_key(render_key(self.get(column))),
            None => identity,
        }
    }

    pub fn relation_loaded(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn relation(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    pub fn set_relation(&mut self, name: impl Into<String>, related: Related) {
        self.relations.insert(name.into(), related);
    }

    /// Records loaded under `name`; empty when the relation is not loaded.
    pub fn related_mut(&mut self, name: &str) -> Vec<&mut Record> {
        match self.relations.get_mut(name) {
            Some(related) => related.records_mut(),
            None => Vec::new(),
        }
    }
}

/// Keys are rendered without JSON quoting so `"7"` and `7` tag alike.
pub fn render_key(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Loaded relation value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Related {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

impl Related {
    pub fn records(&self) -> Vec<&Record> {
        match self {
            Related::One(one) => one.iter().map(|r| r.as_ref()).collect(),
            Related::Many(many) => many.iter().collect(),
        }
    }

    pub fn records_mut(&mut self) -> Vec<&mut Record> {
        match self {
            Related::One(one) => one.iter_mut().map(|r| r.as_mut()).collect(),
            Related::Many(many) => many.iter_mut().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Related::One(one) => usize::from(one.is_some()),
            Related::Many(many) => many.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named relation from one table to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    pub parent_table: String,
    /// Target table. For `MorphTo` this is resolved per type at load time.
    pub related_table: String,
    pub kind: RelationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    HasOne {
        foreign_key: String,
        local_key: String,
    },
    HasMany {
        foreign_key: String,
        local_key: String,
    },
    BelongsTo {
        foreign_key: String,
        owner_key: String,
    },
    /// parent -> through -> related.
    HasManyThrough {
        through_table: String,
        /// Column on the through table pointing at the parent.
        first_key: String,
        /// Column on the related table pointing at the through row.
        second_key: String,
        local_key: String,
        second_local_key: String,
    },
    /// Related table named by `type_column`, keyed by `id_column`.
    MorphTo {
        type_column: String,
        id_column: String,
    },
}

impl Relation {
    pub fn has_many(
        name: impl Into<String>,
        parent_table: impl Into<String>,
        related_table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parent_table: parent_table.into(),
            related_table: related_table.into(),
            kind: RelationKind::HasMany {
                foreign_key: foreign_key.into(),
                local_key: "id".to_string(),
            },
        }
    }

    pub fn has_one(
        name: impl Into<String>,
        parent_table: impl Into<String>,
        related_table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parent_table: parent_table.into(),
            related_table: related_table.into(),
            kind: RelationKind::HasOne {
                foreign_key: foreign_key.into(),
                local_key: "id".to_string(),
            },
        }
    }

    pub fn belongs_to(
        name: impl Into<String>,
        parent_table: impl Into<String>,
        related_table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parent_table: parent_table.into(),
            related_table: related_table.into(),
            kind: RelationKind::BelongsTo {
                foreign_key: foreign_key.into(),
                owner_key: "id".to_string(),
            },
        }
    }

    pub fn has_many_through(
        name: impl Into<String>,
        parent_table: impl Into<String>,
        related_table: impl Into<String>,
        through_table: impl Into<String>,
        first_key: impl Into<String>,
        second_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parent_table: parent_table.into(),
            related_table: related_table.into(),
            kind: RelationKind::HasManyThrough {
                through_table: through_table.into(),
                first_key: first_key.into(),
                second_key: second_key.into(),
                local_key: "id".to_string(),
                second_local_key: "id".to_string(),
            },
        }
    }

    pub fn morph_to(
        name: impl Into<String>,
        parent_table: impl Into<String>,
        type_column: impl Into<String>,
        id_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parent_table: parent_table.into(),
            related_table: String::new(),
            kind: RelationKind::MorphTo {
                type_column: type_column.into(),
                id_column: id_column.into(),
            },
        }
    }

    pub fn is_morph(&self) -> bool {
        matches!(self.kind, RelationKind::MorphTo { .. })
    }

    /// Tables this relation touches, for cache tags.
    ///
    /// A through relation contributes its intermediate table and its far
    /// parent (the table declaring the relation).
    pub fn context(&self) -> RelationContext {
        let context = RelationContext::new(self.related_table.as_str(), self.parent_table.as_str());
        match &self.kind {
            RelationKind::HasManyThrough { through_table, .. } => {
                context.with_through(through_table.as_str(), self.parent_table.as_str())
            }
            _ => context,
        }
    }

    /// The same relation pointing at one concrete table.
    pub fn resolved_to(&self, table: &str) -> Self {
        Self {
            related_table: table.to_string(),
            ..self.clone()
        }
    }
}
