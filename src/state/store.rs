//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Backends only move bytes; serial and lineage bookkeeping lives in
//! [`StateTransaction`](super::StateTransaction).

use async_trait::async_trait;

use crate::error::Result;
use super::lock::LockInfo;
use super::types::{JournalRecord, StateSnapshot};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state: last snapshot plus replayed journal records.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Durably appends one journal record.
    async fn append(&self, record: &JournalRecord) -> Result<()>;

    /// Atomically replaces the snapshot and clears the journal.
    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the advisory lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Extends the expiry of the lock `lock_id` by its lifetime.
    ///
    /// Fails with `ConcurrentModification` if another run now holds the
    /// lock, or `LockLost` if no lock is held.
    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of owner.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
