//! Named cache stores.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use querycache_core::{BackendError, QueryCacheResult};

use super::traits::CacheStore;

/// Named collection of cache stores with a default.
///
/// The first store registered becomes the default unless another is chosen
/// with [`StoreRegistry::with_default`].
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: HashMap<String, Arc<dyn CacheStore>>,
    default: Option<String>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding a single store, which is also the default.
    pub fn single(name: impl Into<String>, store: Arc<dyn CacheStore>) -> Self {
        Self::new().with_store(name, store)
    }

    pub fn with_store(mut self, name: impl Into<String>, store: Arc<dyn CacheStore>) -> Self {
        self.register(name, store);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, store: Arc<dyn CacheStore>) {
        let name = name.into();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.stores.insert(name, store);
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stores.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up a store by name.
    pub fn get(&self, name: &str) -> QueryCacheResult<Arc<dyn CacheStore>> {
        self.stores.get(name).cloned().ok_or_else(|| {
            BackendError::UnknownStore {
                store: name.to_string(),
            }
            .into()
        })
    }

    /// Resolve an optional store name, falling back to the default.
    ///
    /// Returns the resolved name alongside the store.
    pub fn resolve(&self, name: Option<&str>) -> QueryCacheResult<(String, Arc<dyn CacheStore>)> {
        let name = match name.or(self.default.as_deref()) {
            Some(name) => name,
            None => {
                return Err(BackendError::UnknownStore {
                    store: "<default>".to_string(),
                }
                .into())
            }
        };
        Ok((name.to_string(), self.get(name)?))
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("stores", &self.names())
            .field("default", &self.default)
            .finish()
    }
}
