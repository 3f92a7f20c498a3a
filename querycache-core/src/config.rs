//! Configuration types

use crate::{ConfigError, QueryCacheError, QueryCacheResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PREFIX: &str = "q";
pub const DEFAULT_LOCK_WAIT_SECS: u64 = 5;
pub const DEFAULT_TTL_SECS: u64 = 900;

/// Query cache configuration.
///
/// Supplied by the embedding application. Every field has a default so a
/// partial TOML table or a sparse environment is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    /// Master switch. When false every cached read runs uncached.
    pub enable: bool,
    /// Named store to use. `None` selects the registry default.
    pub store: Option<String>,
    /// Namespace prefix for cache keys and tag-version keys.
    pub prefix: String,
    /// How long a cache miss waits for a concurrent recompute, in seconds.
    /// Zero disables stampede locking.
    pub lock_wait_secs: u64,
    /// Default entry lifetime in seconds.
    pub ttl_secs: u64,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            enable: true,
            store: None,
            prefix: DEFAULT_PREFIX.to_string(),
            lock_wait_secs: DEFAULT_LOCK_WAIT_SECS,
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

impl QueryCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read configuration from `QUERY_CACHE_*` environment variables.
    ///
    /// Unset or unparseable variables fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let enable = lookup("QUERY_CACHE_ENABLE")
            .and_then(|s| parse_bool(&s))
            .unwrap_or(defaults.enable);

        let store = lookup("QUERY_CACHE_STORE").filter(|s| !s.trim().is_empty());

        let prefix = lookup("QUERY_CACHE_PREFIX")
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.prefix);

        let lock_wait_secs = lookup("QUERY_CACHE_LOCK_WAIT")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.lock_wait_secs);

        let ttl_secs = lookup("QUERY_CACHE_TTL")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.ttl_secs);

        Self {
            enable,
            store,
            prefix,
            lock_wait_secs,
            ttl_secs,
        }
    }

    /// Parse a TOML document holding the configuration table.
    pub fn from_toml_str(input: &str) -> QueryCacheResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_enable(mut self, enable: bool) -> Self {
        self.enable = enable;
        self
    }

    pub fn with_store(mut self, store: impl Into<String>) -> Self {
        self.store = Some(store.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait_secs = wait.as_secs();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs();
        self
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - prefix is non-empty and contains no `:` (it is the key namespace)
    /// - ttl is positive
    pub fn validate(&self) -> QueryCacheResult<()> {
        if self.prefix.is_empty() {
            return Err(invalid("prefix", &self.prefix, "prefix must not be empty"));
        }

        if self.prefix.contains(':') {
            return Err(invalid(
                "prefix",
                &self.prefix,
                "prefix must not contain ':'",
            ));
        }

        if self.ttl_secs == 0 {
            return Err(invalid(
                "ttl_secs",
                &self.ttl_secs.to_string(),
                "ttl must be positive",
            ));
        }

        if let Some(store) = &self.store {
            if store.trim().is_empty() {
                return Err(invalid("store", store, "store name must not be blank"));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> QueryCacheError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
