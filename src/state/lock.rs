//! Advisory state lock.
//!
//! Only one run may mutate a state at a time. A lock that is not released
//! (crashed process) expires and can then be taken over. A live run keeps
//! pushing its expiry forward with [`LockInfo::renew`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Default lifetime of a lock between renewals.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs());

const fn default_ttl_ms() -> i64 {
    LOCK_EXPIRY_SECS * 1000
}

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// What the holder is doing (`apply`, `refresh`, ...).
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
    /// Lifetime granted by each renewal, in milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: i64,
}

impl LockInfo {
    /// Creates a new lock info with the default lifetime.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        Self::with_ttl(holder, operation, DEFAULT_LOCK_TTL)
    }

    /// Creates a new lock info that expires `ttl` after acquisition.
    #[must_use]
    pub fn with_ttl(holder: &str, operation: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl_ms),
            ttl_ms,
        }
    }

    /// Lifetime granted by each renewal.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.unsigned_abs())
    }

    /// Pushes the expiry one lifetime past now.
    pub fn renew(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::milliseconds(self.ttl_ms);
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }

    /// Converts a live lock into the error reported to a competing run.
    #[must_use]
    pub fn conflict(&self) -> crate::error::StateError {
        crate::error::StateError::ConcurrentModification {
            holder: self.holder.clone(),
            since: self.acquired_at.to_rfc3339(),
        }
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("test-holder", "apply");
        assert_eq!(lock.holder, "test-holder");
        assert_eq!(lock.operation, "apply");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("test-holder", "apply");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_renew_extends_expiry() {
        let mut lock = LockInfo::with_ttl("test-holder", "apply", Duration::from_secs(60));
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());

        lock.renew();
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 50);
        assert_eq!(lock.ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_lock_without_ttl_field_uses_default() {
        let lock = LockInfo::new("old-run", "apply");
        let mut json = serde_json::to_value(&lock).expect("serialize");
        json.as_object_mut().expect("object").remove("ttl_ms");
        let parsed: LockInfo = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed.ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_conflict_error() {
        let lock = LockInfo::new("ci-runner", "apply");
        let err = lock.conflict();
        assert!(err.to_string().contains("ci-runner"));
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        // IDs should be unique
        assert_ne!(id1, id2);

        // IDs should contain the process ID
        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }
}
