//! Transactional write path for a state.
//!
//! A [`StateTransaction`] owns the advisory lock for the duration of a run.
//! Every mutation is appended to the journal before the in-memory snapshot
//! changes, so the durable state is never behind what the run believes.
//!
//! The lock is renewed by a background tick and again before every append.
//! An append is refused once the lock belongs to someone else.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};
use crate::schema::InstanceId;

use super::lock::LockInfo;
use super::store::StateStore;
use super::types::{InstanceState, JournalChange, JournalRecord, RunHistoryEntry, StateSnapshot};

/// Locked, write-ahead view of a state.
pub struct StateTransaction {
    store: Arc<dyn StateStore>,
    lock: LockInfo,
    snapshot: Mutex<StateSnapshot>,
    started_serial: u64,
    keepalive: CancellationToken,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
}

/// Shortest interval between background renewals.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

fn spawn_keepalive(store: Arc<dyn StateStore>, lock: &LockInfo, stop: CancellationToken) -> JoinHandle<()> {
    let lock_id = lock.lock_id.clone();
    let period = (lock.ttl() / 3).max(MIN_RENEW_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if stop.is_cancelled() {
                        break;
                    }
                    match store.renew_lock(&lock_id).await {
                        Ok(_) => {}
                        Err(e @ ConvergeError::State(
                            StateError::LockLost { .. } | StateError::ConcurrentModification { .. },
                        )) => {
                            warn!(lock_id = %lock_id, "State lock lost: {e}");
                            break;
                        }
                        Err(e) => warn!(lock_id = %lock_id, "State lock renewal failed: {e}"),
                    }
                }
            }
        }
    })
}

impl std::fmt::Debug for StateTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTransaction")
            .field("backend", &self.store.backend_type())
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl StateTransaction {
    /// Locks the state and loads it, creating an empty state if none exists.
    ///
    /// Journal records left by an interrupted run are compacted into the
    /// snapshot before the transaction starts.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentModification` if another run holds the lock, or
    /// any load/write failure. The lock is released on failure.
    pub async fn begin(store: Arc<dyn StateStore>, holder: &str, operation: &str) -> Result<Self> {
        let lock = store.acquire_lock(holder, operation).await?;

        let prepared = async {
            let snapshot = store.load().await?.unwrap_or_default();
            store.write_snapshot(&snapshot).await?;
            Ok::<_, ConvergeError>(snapshot)
        }
        .await;

        match prepared {
            Ok(snapshot) => {
                debug!(
                    lineage = %snapshot.lineage,
                    serial = snapshot.serial,
                    "State transaction started"
                );
                let keepalive = CancellationToken::new();
                let task = spawn_keepalive(Arc::clone(&store), &lock, keepalive.clone());
                Ok(Self {
                    store,
                    lock,
                    started_serial: snapshot.serial,
                    snapshot: Mutex::new(snapshot),
                    keepalive,
                    keepalive_task: Mutex::new(Some(task)),
                })
            }
            Err(e) => {
                if let Err(release) = store.release_lock(&lock.lock_id).await {
                    warn!("Failed to release state lock after error: {release}");
                }
                Err(e)
            }
        }
    }

    /// The lock held by this transaction.
    #[must_use]
    pub const fn lock_info(&self) -> &LockInfo {
        &self.lock
    }

    /// Copy of the current in-memory snapshot.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// Current serial.
    pub async fn serial(&self) -> u64 {
        self.snapshot.lock().await.serial
    }

    /// Current state of one instance.
    pub async fn instance(&self, id: &InstanceId) -> Option<InstanceState> {
        self.snapshot.lock().await.get(id).cloned()
    }

    /// Returns true if the instance is tainted.
    pub async fn is_tainted(&self, id: &InstanceId) -> bool {
        self.snapshot.lock().await.is_tainted(id)
    }

    /// Persists the new state of an instance after a successful operation.
    /// Clears any taint.
    ///
    /// # Errors
    ///
    /// Returns an error if the state holds unresolved values or the store
    /// rejects the write.
    pub async fn commit_instance(&self, id: &InstanceId, state: InstanceState) -> Result<u64> {
        Self::check_known(id, &state)?;
        self.record(JournalChange::Put {
            instance: id.clone(),
            state,
            clear_taint: true,
        })
        .await
    }

    /// Persists attributes read back from the provider; taint is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the state holds unresolved values or the store
    /// rejects the write.
    pub async fn refresh_instance(&self, id: &InstanceId, state: InstanceState) -> Result<u64> {
        Self::check_known(id, &state)?;
        self.record(JournalChange::Put {
            instance: id.clone(),
            state,
            clear_taint: false,
        })
        .await
    }

    /// Records that an instance no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn remove_instance(&self, id: &InstanceId) -> Result<u64> {
        self.record(JournalChange::Remove {
            instance: id.clone(),
        })
        .await
    }

    /// Marks an instance for replacement.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn taint(&self, id: &InstanceId) -> Result<u64> {
        self.record(JournalChange::Taint {
            instance: id.clone(),
        })
        .await
    }

    /// Clears a taint marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn untaint(&self, id: &InstanceId) -> Result<u64> {
        self.record(JournalChange::Untaint {
            instance: id.clone(),
        })
        .await
    }

    fn check_known(id: &InstanceId, state: &InstanceState) -> Result<()> {
        if state.is_fully_known() {
            Ok(())
        } else {
            Err(ConvergeError::State(StateError::serialization(format!(
                "{id} still holds unresolved values and cannot be persisted"
            ))))
        }
    }

    async fn record(&self, change: JournalChange) -> Result<u64> {
        let mut snapshot = self.snapshot.lock().await;
        self.store.renew_lock(&self.lock.lock_id).await?;
        let record = JournalRecord {
            serial: snapshot.serial + 1,
            lineage: snapshot.lineage.clone(),
            at: Utc::now(),
            change,
        };

        self.store.append(&record).await?;

        snapshot.apply_change(&record.change);
        snapshot.serial = record.serial;
        Ok(record.serial)
    }

    /// Appends the run summary, writes a compacted snapshot with a new
    /// serial and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock was lost or the snapshot cannot be
    /// written; the journal then stays replayable.
    pub async fn finalize(&self, entry: RunHistoryEntry) -> Result<u64> {
        self.stop_keepalive().await;
        let serial = self.seal(entry).await?;
        self.store.release_lock(&self.lock.lock_id).await?;
        info!(serial, "State finalized");
        Ok(serial)
    }

    /// Ends a failed run and releases the lock.
    ///
    /// Records committed by the run are sealed under a new serial with
    /// `entry` in the history, so plans computed before the run no longer
    /// apply. A run that committed nothing leaves the state untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be released.
    pub async fn abort(&self, entry: RunHistoryEntry) -> Result<()> {
        self.stop_keepalive().await;
        if self.serial().await == self.started_serial {
            warn!("Aborting state transaction, nothing committed");
        } else {
            match self.seal(entry).await {
                Ok(serial) => warn!(serial, "Aborting state transaction, committed records sealed"),
                Err(e) => warn!("Aborting state transaction, journal left for replay: {e}"),
            }
        }
        self.store.release_lock(&self.lock.lock_id).await
    }

    async fn seal(&self, entry: RunHistoryEntry) -> Result<u64> {
        let mut snapshot = self.snapshot.lock().await;
        self.store.renew_lock(&self.lock.lock_id).await?;

        let mut next = snapshot.clone();
        next.serial += 1;
        next.last_updated = Utc::now();
        next.add_history(entry);

        self.store.write_snapshot(&next).await?;
        *snapshot = next;
        Ok(snapshot.serial)
    }

    async fn stop_keepalive(&self) {
        self.keepalive.cancel();
        if let Some(task) = self.keepalive_task.lock().await.take()
            && let Err(e) = task.await
        {
            warn!("State lock keepalive ended abnormally: {e}");
        }
    }
}

impl Drop for StateTransaction {
    fn drop(&mut self) {
        self.keepalive.cancel();
    }
}
