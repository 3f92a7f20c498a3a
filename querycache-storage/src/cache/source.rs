//! The data source seam.
//!
//! A `DataSource` runs read operations (returning rows) and write
//! statements (returning an affected count). The query cache wraps one
//! source in a proxy that implements the same trait, so callers cannot tell
//! cached and uncached connections apart.

use std::sync::Arc;

use async_trait::async_trait;
use querycache_core::{QueryCacheResult, ResultSet, Row};
use serde_json::Value;

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Stable name of the source. Part of every fingerprint, so two sources
    /// running the same query text never share entries.
    fn identity(&self) -> &str;

    /// Run a read operation.
    async fn select(&self, query: &str, bindings: &[Value]) -> QueryCacheResult<ResultSet>;

    /// Run a read operation and keep the first row.
    async fn select_one(&self, query: &str, bindings: &[Value]) -> QueryCacheResult<Option<Row>> {
        Ok(self.select(query, bindings).await?.into_iter().next())
    }

    /// Run a write statement. Never cached.
    async fn statement(&self, query: &str, bindings: &[Value]) -> QueryCacheResult<u64>;

    /// The source this one wraps, if it is a proxy.
    fn inner_source(&self) -> Option<Arc<dyn DataSource>> {
        None
    }
}

/// Strip any proxy layers from `source`.
pub fn unwrap_source(source: Arc<dyn DataSource>) -> Arc<dyn DataSource> {
    let mut current = source;
    while let Some(inner) = current.inner_source() {
        current = inner;
    }
    current
}
