//! Entry lifetimes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a cached result lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ttl {
    /// Relative lifetime from the moment of storing.
    Duration(Duration),
    /// Absolute expiry instant.
    Until(DateTime<Utc>),
}

impl Ttl {
    pub fn seconds(secs: u64) -> Self {
        Ttl::Duration(Duration::from_secs(secs))
    }

    /// Whole seconds remaining as of `now`. Never negative.
    pub fn as_secs_at(&self, now: DateTime<Utc>) -> u64 {
        match self {
            Ttl::Duration(duration) => duration.as_secs(),
            Ttl::Until(at) => at.signed_duration_since(now).num_seconds().max(0) as u64,
        }
    }

    /// Remaining lifetime as of now, or `None` when it is already spent.
    pub fn remaining(&self) -> Option<Duration> {
        match self.as_secs_at(Utc::now()) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        Ttl::Duration(duration)
    }
}

impl From<DateTime<Utc>> for Ttl {
    fn from(at: DateTime<Utc>) -> Self {
        Ttl::Until(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_ttl() {
        assert_eq!(Ttl::seconds(90).remaining(), Some(Duration::from_secs(90)));
        assert_eq!(Ttl::Duration(Duration::from_millis(900)).remaining(), None);
    }

    #[test]
    fn test_until_ttl() {
        let now = Utc::now();
        let ttl = Ttl::Until(now + chrono::Duration::seconds(30));
        assert_eq!(ttl.as_secs_at(now), 30);

        let past = Ttl::Until(now - chrono::Duration::seconds(5));
        assert_eq!(past.as_secs_at(now), 0);
        assert_eq!(past.remaining(), None);
    }
}
