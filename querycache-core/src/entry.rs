//! Stored cache entries.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A cached, serialized result. Read-only once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Vec<u8>,
    /// `None` means the entry never expires on its own.
    pub ttl: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, payload: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            payload,
            ttl,
            created_at: Utc::now(),
        }
    }

    /// Age of the entry as of now.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
