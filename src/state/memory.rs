//! In-memory state backend.
//!
//! Keeps snapshot and journal separately, like the file backend, so crash
//! and outage behaviour can be exercised without touching disk.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{DEFAULT_LOCK_TTL, LockInfo};
use super::store::StateStore;
use super::types::{JournalRecord, StateSnapshot};

#[derive(Debug, Default)]
struct Inner {
    snapshot: Option<StateSnapshot>,
    journal: Vec<JournalRecord>,
    lock: Option<LockInfo>,
    appends_left: Option<usize>,
}

/// Process-local state store.
#[derive(Debug)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
    lock_ttl: Duration,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Sets the lifetime of locks taken from this store.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Switches the simulated medium on or off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes every append after the next `n` fail with `StoreUnavailable`.
    pub async fn fail_appends_after(&self, n: usize) {
        self.inner.lock().await.appends_left = Some(n);
    }

    /// Lifts a limit set by [`Self::fail_appends_after`].
    pub async fn accept_all_appends(&self) {
        self.inner.lock().await.appends_left = None;
    }

    /// Number of journal records not yet compacted.
    pub async fn journal_len(&self) -> usize {
        self.inner.lock().await.journal.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConvergeError::State(StateError::unavailable(
                "memory store switched off",
            )))
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let Some(mut snapshot) = inner.snapshot.clone() else {
            return Ok(None);
        };
        snapshot.replay(&inner.journal)?;
        Ok(Some(snapshot))
    }

    async fn append(&self, record: &JournalRecord) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if let Some(left) = inner.appends_left {
            if left == 0 {
                return Err(ConvergeError::State(StateError::unavailable(
                    "memory store rejected the write",
                )));
            }
            inner.appends_left = Some(left - 1);
        }
        inner.journal.push(record.clone());
        debug!(serial = record.serial, "Journal record committed (memory)");
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.snapshot = Some(snapshot.clone());
        inner.journal.clear();
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        self.check_available()?;
        Ok(self.inner.lock().await.snapshot.is_some())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if let Some(existing) = &inner.lock
            && !existing.is_expired()
        {
            return Err(ConvergeError::State(existing.conflict()));
        }
        let lock = LockInfo::with_ttl(holder, operation, self.lock_ttl);
        inner.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.lock.as_mut() {
            Some(lock) if lock.lock_id == lock_id => {
                lock.renew();
                Ok(lock.clone())
            }
            Some(other) if !other.is_expired() => Err(ConvergeError::State(other.conflict())),
            _ => Err(ConvergeError::State(StateError::LockLost {
                lock_id: lock_id.to_string(),
            })),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            inner.lock = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.inner.lock().await.lock = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.inner.lock().await.lock.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
