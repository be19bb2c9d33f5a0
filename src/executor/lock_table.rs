//! Per-object lock table.
//!
//! Serializes provider calls that mutate the same remote object, even when
//! they come from unrelated instances. Keys are `type:provider-id`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Shared table of async mutexes keyed by remote object.
#[derive(Debug, Default)]
pub struct LockTable {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for a remote object.
    #[must_use]
    pub fn key(resource_type: &str, provider_id: &str) -> String {
        format!("{resource_type}:{provider_id}")
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(entries.entry(key.to_string()).or_default())
        };
        entry.lock_owned().await
    }

    /// Number of keys seen so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map_or(0, |entries| entries.len())
    }

    /// Returns true if no key has been locked yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
