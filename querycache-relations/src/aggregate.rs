//! Aggregates over related records.

use std::fmt;

use querycache_core::{InputError, QueryCacheResult};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::model::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Exists,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Exists => "exists",
        }
    }

    /// Whether the function reads a column rather than counting rows.
    pub fn needs_column(&self) -> bool {
        !matches!(self, AggregateFunction::Count | AggregateFunction::Exists)
    }

    /// Compute the aggregate over `records`.
    ///
    /// Follows SQL: sum, min, max and avg of nothing are null.
    pub fn apply(&self, records: &[&Record], column: Option<&str>) -> Value {
        match self {
            AggregateFunction::Count => Value::from(records.len() as u64),
            AggregateFunction::Exists => Value::Bool(!records.is_empty()),
            _ => {
                let values: Vec<&Number> = column
                    .map(|column| {
                        records
                            .iter()
                            .filter_map(|r| match r.get(column) {
                                Some(Value::Number(n)) => Some(n),
                                _ => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                self.fold(&values)
            }
        }
    }

    fn fold(&self, values: &[&Number]) -> Value {
        if values.is_empty() {
            return Value::Null;
        }
        let all_integers = values.iter().all(|n| n.is_i64());
        let floats = values.iter().filter_map(|n| n.as_f64());

        match self {
            AggregateFunction::Sum if all_integers => {
                Value::from(values.iter().filter_map(|n| n.as_i64()).sum::<i64>())
            }
            AggregateFunction::Sum => float(floats.sum()),
            AggregateFunction::Min if all_integers => {
                values.iter().filter_map(|n| n.as_i64()).min().map_or(Value::Null, Value::from)
            }
            AggregateFunction::Min => float(floats.fold(f64::INFINITY, f64::min)),
            AggregateFunction::Max if all_integers => {
                values.iter().filter_map(|n| n.as_i64()).max().map_or(Value::Null, Value::from)
            }
            AggregateFunction::Max => float(floats.fold(f64::NEG_INFINITY, f64::max)),
            AggregateFunction::Avg => float(floats.sum::<f64>() / values.len() as f64),
            AggregateFunction::Count | AggregateFunction::Exists => Value::Null,
        }
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relation name with the attribute its aggregate is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateTarget {
    pub relation: String,
    pub alias: String,
}

impl AggregateTarget {
    /// Parse `"name"` or `"name as alias"`.
    ///
    /// Without an alias the attribute is the snake case of
    /// `"{name} {function} {column}"` with punctuation dropped, so counting
    /// `comments` gives `comments_count`.
    pub fn parse(
        entry: &str,
        function: AggregateFunction,
        column: Option<&str>,
    ) -> QueryCacheResult<Self> {
        let segments: Vec<&str> = entry.split_whitespace().collect();
        let (relation, alias) = match segments.as_slice() {
            [name] => (*name, None),
            [name, kw, alias] if kw.eq_ignore_ascii_case("as") => (*name, Some(*alias)),
            _ => {
                return Err(InputError::InvalidRelationPath {
                    path: entry.to_string(),
                    reason: "expected \"relation\" or \"relation as alias\"".to_string(),
                }
                .into())
            }
        };

        if relation.contains('.') {
            return Err(InputError::InvalidRelationPath {
                path: entry.to_string(),
                reason: "aggregates cannot be taken over nested relations".to_string(),
            }
            .into());
        }

        let alias = match alias {
            Some(alias) => alias.to_string(),
            None => default_alias(relation, function, column.unwrap_or("*")),
        };
        Ok(Self {
            relation: relation.to_string(),
            alias,
        })
    }
}

fn default_alias(relation: &str, function: AggregateFunction, column: &str) -> String {
    let raw = format!("{relation} {function} {column}");
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    cleaned
        .split_whitespace()
        .map(snake_case)
        .collect::<Vec<_>>()
        .join("_")
}

fn snake_case(word: &str) -> String {
    let mut out = String::with_capacity(word.len() + 4);
    for (i, c) in word.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
