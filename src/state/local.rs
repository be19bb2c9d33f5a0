//! Local file-based state storage backend.
//!
//! Layout of the state directory:
//! - `state.json`: last compacted snapshot, replaced atomically
//! - `state.journal`: one JSON record per committed mutation since then
//! - `state.lock`: advisory lock, created with create-new semantics

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_STATE_DIR;
use crate::error::{ConvergeError, Result, StateError};

use super::lock::{DEFAULT_LOCK_TTL, LockInfo};
use super::store::StateStore;
use super::types::{JournalRecord, StateSnapshot};

/// State file name.
const STATE_FILE: &str = "state.json";

/// Journal file name.
const JOURNAL_FILE: &str = "state.journal";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the snapshot file.
    state_path: PathBuf,
    /// Path to the journal file.
    journal_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Lifetime of locks taken from this store.
    lock_ttl: Duration,
}

fn unavailable(context: &str, path: &Path, e: &std::io::Error) -> ConvergeError {
    ConvergeError::State(StateError::unavailable(format!(
        "{context} {}: {e}",
        path.display()
    )))
}

impl LocalStateStore {
    /// Creates a new local state store in `.converge` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ConvergeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(DEFAULT_STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let journal_path = base_dir.join(JOURNAL_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            journal_path,
            lock_path,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    /// Sets the lifetime of locks taken from this store.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Base directory of the store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| unavailable("Failed to create state directory", &self.base_dir, &e))?;
        }
        Ok(())
    }

    /// Reads the snapshot file if it exists.
    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable("Failed to read state file", &self.state_path, &e)),
        };

        let snapshot: StateSnapshot = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!(
                "Failed to parse state file: {e}"
            )))
        })?;
        snapshot.check_version()?;

        Ok(Some(snapshot))
    }

    /// Reads the journal, dropping a torn trailing record.
    async fn read_journal(&self) -> Result<Vec<JournalRecord>> {
        let content = match fs::read_to_string(&self.journal_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable("Failed to read journal", &self.journal_path, &e)),
        };

        parse_journal(&content)
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable("Failed to read lock file", &self.lock_path, &e)),
        };

        // A lock file torn by a crash during acquisition is treated as stale.
        match serde_json::from_str::<LockInfo>(&content) {
            Ok(lock_info) => Ok(Some(lock_info)),
            Err(e) => {
                warn!("Ignoring unreadable lock file {}: {e}", self.lock_path.display());
                let mut stale = LockInfo::new("unknown", "unknown");
                stale.expires_at = stale.acquired_at;
                Ok(Some(stale))
            }
        }
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(unavailable("Failed to create lock file", &self.lock_path, &e)),
        };

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| unavailable("Failed to write lock file", &self.lock_path, &e))?;

        file.sync_all()
            .await
            .map_err(|e| unavailable("Failed to sync lock file", &self.lock_path, &e))?;

        Ok(true)
    }

    /// Replaces `path` through a synced temporary file and a rename, then
    /// syncs the directory so the rename itself survives a crash.
    async fn write_atomically(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| unavailable("Failed to create temp file", &temp_path, &e))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| unavailable("Failed to write temp file", &temp_path, &e))?;

        file.sync_all()
            .await
            .map_err(|e| unavailable("Failed to sync temp file", &temp_path, &e))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| unavailable("Failed to rename temp file onto", path, &e))?;

        self.sync_dir().await
    }

    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<()> {
        let dir = fs::File::open(&self.base_dir)
            .await
            .map_err(|e| unavailable("Failed to open state directory", &self.base_dir, &e))?;
        dir.sync_all()
            .await
            .map_err(|e| unavailable("Failed to sync state directory", &self.base_dir, &e))
    }

    // Directory handles cannot be synced here; the rename is as durable as
    // the platform makes it.
    #[cfg(not(unix))]
    async fn sync_dir(&self) -> Result<()> {
        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable("Failed to delete lock file", &self.lock_path, &e)),
        }
    }
}

/// Parses journal lines. A malformed final line is a torn write and is
/// dropped; a malformed line followed by valid ones is corruption.
fn parse_journal(content: &str) -> Result<Vec<JournalRecord>> {
    let lines: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();

    let mut records = Vec::with_capacity(lines.len());
    for (position, (line_no, line)) in lines.iter().enumerate() {
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if position + 1 == lines.len() => {
                warn!("Ignoring torn journal record at line {}: {e}", line_no + 1);
            }
            Err(e) => {
                return Err(ConvergeError::State(StateError::corrupted(format!(
                    "Malformed journal record at line {}: {e}",
                    line_no + 1
                ))));
            }
        }
    }

    Ok(records)
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let snapshot = self.read_snapshot().await?;
        let records = self.read_journal().await?;

        let Some(mut snapshot) = snapshot else {
            if records.is_empty() {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            return Err(ConvergeError::State(StateError::corrupted(
                "journal present without a snapshot",
            )));
        };

        info!("Loading state from: {}", self.state_path.display());

        let replayed = snapshot.replay(&records)?;
        if replayed > 0 {
            info!(
                "Replayed {replayed} journal record(s), state is at serial {}",
                snapshot.serial
            );
        }

        Ok(Some(snapshot))
    }

    async fn append(&self, record: &JournalRecord) -> Result<()> {
        self.ensure_dir().await?;

        let mut line = serde_json::to_string(record).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize journal record: {e}"
            )))
        })?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .await
            .map_err(|e| unavailable("Failed to open journal", &self.journal_path, &e))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| unavailable("Failed to append to journal", &self.journal_path, &e))?;

        file.sync_data()
            .await
            .map_err(|e| unavailable("Failed to sync journal", &self.journal_path, &e))?;

        debug!(serial = record.serial, instance = %record.change.instance(), "Journal record committed");
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        info!("Saving state to: {}", self.state_path.display());

        let content = serde_json::to_string_pretty(snapshot).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        self.write_atomically(&self.state_path, &content).await?;

        // Records up to the new serial are now part of the snapshot.
        match fs::remove_file(&self.journal_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(unavailable("Failed to clear journal", &self.journal_path, &e)),
        }

        debug!(serial = snapshot.serial, "State saved successfully");
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::with_ttl(holder, operation, self.lock_ttl);

        // One retry after taking over an expired lock.
        for _ in 0..2 {
            if self.create_lock_file(&lock_info).await? {
                info!(
                    "Acquired state lock: {} (expires in {}s)",
                    lock_info.lock_id,
                    lock_info.remaining_secs()
                );
                return Ok(lock_info);
            }

            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(ConvergeError::State(existing.conflict()));
                }
                Some(existing) => {
                    warn!(
                        "Expired lock held by {} found, taking over",
                        existing.holder
                    );
                    self.delete_lock_file().await?;
                }
                None => {}
            }
        }

        Err(ConvergeError::State(StateError::unavailable(
            "lock file keeps reappearing; another run is racing for the lock",
        )))
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock = match self.read_lock_file().await? {
            Some(lock) if lock.lock_id == lock_id => lock,
            Some(other) if !other.is_expired() => return Err(ConvergeError::State(other.conflict())),
            _ => {
                return Err(ConvergeError::State(StateError::LockLost {
                    lock_id: lock_id.to_string(),
                }));
            }
        };

        lock.renew();
        let content = serde_json::to_string_pretty(&lock).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;
        self.write_atomically(&self.lock_path, &content).await?;
        debug!(lock_id, expires_at = %lock.expires_at, "Renewed state lock");
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        warn!("Force-removing state lock at {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attributes, InstanceId, Value};
    use crate::state::types::{InstanceState, JournalChange};
    use chrono::Utc;
    use tempfile::TempDir;

    async fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn put(snapshot: &StateSnapshot, serial: u64, name: &str) -> JournalRecord {
        let id = InstanceId::new("network", name);
        let mut attributes = Attributes::new();
        attributes.insert(String::from("cidr"), Value::string("10.0.0.0/16"));
        JournalRecord {
            serial,
            lineage: snapshot.lineage.clone(),
            at: Utc::now(),
            change: JournalChange::Put {
                state: InstanceState::new(&id, format!("net-{name}"), attributes),
                instance: id,
                clear_taint: true,
            },
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store().await;

        let snapshot = StateSnapshot::new();
        store.write_snapshot(&snapshot).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.lineage, snapshot.lineage);
        assert_eq!(loaded.serial, 0);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store().await;

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_journal_replay_and_compaction() {
        let (store, temp) = create_test_store().await;
        let snapshot = StateSnapshot::new();
        store.write_snapshot(&snapshot).await.expect("Failed to save state");

        store.append(&put(&snapshot, 1, "a")).await.expect("append");
        store.append(&put(&snapshot, 2, "b")).await.expect("append");

        let loaded = store.load().await.expect("load").expect("state");
        assert_eq!(loaded.serial, 2);
        assert_eq!(loaded.instances.len(), 2);

        store.write_snapshot(&loaded).await.expect("compact");
        assert!(!temp.path().join(JOURNAL_FILE).exists());

        let reloaded = store.load().await.expect("load").expect("state");
        assert_eq!(reloaded, loaded);
    }

    #[tokio::test]
    async fn test_torn_trailing_record_is_ignored() {
        let (store, temp) = create_test_store().await;
        let snapshot = StateSnapshot::new();
        store.write_snapshot(&snapshot).await.expect("Failed to save state");
        store.append(&put(&snapshot, 1, "a")).await.expect("append");

        let journal = temp.path().join(JOURNAL_FILE);
        let mut content = std::fs::read_to_string(&journal).expect("read journal");
        content.push_str("{\"serial\":2,\"lineage\":");
        std::fs::write(&journal, content).expect("write torn journal");

        let loaded = store.load().await.expect("load").expect("state");
        assert_eq!(loaded.serial, 1);
        assert_eq!(loaded.instances.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_record_mid_journal_is_corruption() {
        let (store, temp) = create_test_store().await;
        let snapshot = StateSnapshot::new();
        store.write_snapshot(&snapshot).await.expect("Failed to save state");

        let journal = temp.path().join(JOURNAL_FILE);
        let valid = serde_json::to_string(&put(&snapshot, 1, "a")).expect("serialize");
        std::fs::write(&journal, format!("not json\n{valid}\n")).expect("write journal");

        let err = store.load().await.expect_err("corrupted");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store().await;

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store().await;

        let _lock1 = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let err = store
            .acquire_lock("holder-2", "apply")
            .await
            .expect_err("second lock must fail");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::ConcurrentModification { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, temp) = create_test_store().await;

        let mut stale = LockInfo::new("crashed-run", "apply");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(5);
        std::fs::write(
            temp.path().join(LOCK_FILE),
            serde_json::to_string(&stale).expect("serialize"),
        )
        .expect("write stale lock");

        let lock = store
            .acquire_lock("new-run", "apply")
            .await
            .expect("stale lock taken over");
        assert_eq!(lock.holder, "new-run");
    }

    #[tokio::test]
    async fn test_renew_lock_extends_expiry_on_disk() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp.path()).with_lock_ttl(Duration::from_millis(200));

        let lock = store.acquire_lock("holder", "apply").await.expect("lock");
        tokio::time::sleep(Duration::from_millis(120)).await;
        let renewed = store.renew_lock(&lock.lock_id).await.expect("renew");
        assert!(renewed.expires_at > lock.expires_at);

        let on_disk = store.get_lock_info().await.expect("read").expect("lock");
        assert_eq!(on_disk.expires_at, renewed.expires_at);
        assert!(!temp.path().join("state.lock.tmp").exists());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.is_locked().await.expect("is_locked"));
    }

    #[tokio::test]
    async fn test_renew_lock_of_another_holder_is_refused() {
        let (store, _temp) = create_test_store().await;
        let _held = store.acquire_lock("holder-1", "apply").await.expect("lock");

        let err = store.renew_lock("not-my-lock").await.expect_err("foreign lock");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::ConcurrentModification { .. })
        ));

        store.force_unlock().await.expect("unlock");
        let err = store.renew_lock("not-my-lock").await.expect_err("no lock");
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_write_leaves_no_temp_file() {
        let (store, temp) = create_test_store().await;
        let mut snapshot = StateSnapshot::new();
        snapshot.serial = 4;

        store.write_snapshot(&snapshot).await.expect("write");
        store.write_snapshot(&snapshot).await.expect("rewrite");

        assert!(!temp.path().join("state.json.tmp").exists());
        let loaded = store.load().await.expect("load").expect("state");
        assert_eq!(loaded.serial, 4);
    }

    #[tokio::test]
    async fn test_unavailable_directory() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "x").expect("write blocker");
        let store = LocalStateStore::with_base_dir(&blocker);

        let err = store
            .write_snapshot(&StateSnapshot::new())
            .await
            .expect_err("cannot write under a file");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::StoreUnavailable { .. })
        ));
    }
}
