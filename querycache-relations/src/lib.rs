//! Query Cache Relations - Cached Relation Loading
//!
//! Expands relation load specifications (`"posts.comments:withTrashed"`,
//! per-relation constraints, polymorphic type maps) into deduplicated load
//! plans and runs every load through the query cache, tagged with the
//! tables it touches. Aggregates over relations (count, sum, min, max, avg,
//! exists) go through the same path and land on each record as attributes.

pub mod aggregate;
pub mod loader;
pub mod model;
pub mod plan;
pub mod query;
pub mod source;

pub use aggregate::{AggregateFunction, AggregateTarget};
pub use loader::{MorphSpec, RelationLoader};
pub use model::{render_key, Record, Related, Relation, RelationKind};
pub use plan::{LoadNode, LoadPlan, ParsedPath, RelationSpec, SpecEntry};
pub use query::{constraint, Constraint, Direction, RelationQuery};
pub use source::{require_column, unknown_relation, RelationSource};
