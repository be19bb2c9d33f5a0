//! State management module for the converge engine.
//!
//! This module provides persistent, transactional storage of the last
//! applied state: per-instance attributes and provider identifiers, taint
//! markers, and run history.

mod local;
mod lock;
mod memory;
mod store;
mod transaction;
mod types;

use std::path::Path;
use std::sync::Arc;

use crate::config::{StateBackend, StateConfig};

pub use local::LocalStateStore;
pub use lock::{DEFAULT_LOCK_TTL, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use transaction::StateTransaction;
pub use types::{
    InstanceState, JournalChange, JournalRecord, MAX_HISTORY, RunHistoryEntry, RunOperation,
    STATE_VERSION, StateSnapshot,
};

/// Builds the store selected by the manifest.
#[must_use]
pub fn create_store(config: &StateConfig, base: &Path) -> Arc<dyn StateStore> {
    match config.backend {
        StateBackend::Local => Arc::new(LocalStateStore::with_base_dir(config.directory(base))),
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
    }
}
