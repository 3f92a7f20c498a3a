//! Error types for query cache operations

use std::time::Duration;
use thiserror::Error;

/// Cache and tag-version backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Cache backend {store} unavailable: {reason}")]
    Unavailable { store: String, reason: String },

    #[error("Timed out after {waited:?} waiting for lock on {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("The [{store}] cache does not support {capability}")]
    UnsupportedCapability { store: String, capability: String },

    #[error("Unknown cache store: {store}")]
    UnknownStore { store: String },

    #[error("Corrupt cache entry at {key}: {reason}")]
    CorruptEntry { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    ParseFailed { reason: String },
}

/// Caller input errors. These fail the specific call and never touch shared state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("Query cache tag must be provided")]
    MissingTags,

    #[error("Invalid cache tag {tag:?}: {reason}")]
    InvalidTag { tag: String, reason: String },

    #[error("Query parameter {index} cannot be serialized: {reason}")]
    NonSerializableParameter { index: usize, reason: String },

    #[error("Malformed relation path {path:?}: {reason}")]
    InvalidRelationPath { path: String, reason: String },

    #[error("Relation {relation} is not defined on {table}")]
    UnknownRelation { table: String, relation: String },

    #[error("Unsupported aggregate {function} on relation {relation}")]
    UnsupportedAggregate { relation: String, function: String },
}

/// Errors raised by the underlying data source. Passed through unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Query failed on {source_name}: {reason}")]
    QueryFailed { source_name: String, reason: String },

    #[error("Malformed result from {source_name}: {reason}")]
    MalformedResult { source_name: String, reason: String },
}

/// Master error type for all query cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryCacheError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Data source error: {0}")]
    Source(#[from] SourceError),
}

impl QueryCacheError {
    /// Transient backend failures that the read path recovers from by
    /// running the operation uncached.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueryCacheError::Backend(BackendError::Unavailable { .. })
                | QueryCacheError::Backend(BackendError::CorruptEntry { .. })
        )
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, QueryCacheError::Backend(BackendError::LockTimeout { .. }))
    }

    /// Shorthand for an unavailable-backend error.
    pub fn unavailable(store: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Unavailable {
            store: store.into(),
            reason: reason.into(),
        }
        .into()
    }
}

/// Result type alias for query cache operations.
pub type QueryCacheResult<T> = Result<T, QueryCacheError>;
