//! State types for tracking applied infrastructure.
//!
//! A [`StateSnapshot`] is the last-known-applied view of every managed
//! instance. Between snapshots, each committed mutation is recorded as a
//! [`JournalRecord`] so a crash never loses a completed operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::StateError;
use crate::schema::{Attributes, InstanceId};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of run history entries kept in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete applied state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Identity of this state, fixed for its whole life.
    pub lineage: String,
    /// Incremented on every durable mutation.
    pub serial: u64,
    /// Applied instances.
    #[serde(default)]
    pub instances: BTreeMap<InstanceId, InstanceState>,
    /// Instances whose last operation failed and must be replaced.
    #[serde(default)]
    pub tainted: BTreeSet<InstanceId>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Applied state of a single instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Opaque provider identifier.
    pub id: String,
    /// Attributes as last reported by the provider.
    pub attributes: Attributes,
    /// Instances this one depended on when it was applied.
    #[serde(default)]
    pub dependencies: Vec<InstanceId>,
    /// Replacement policy in force when applied.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Provider ids of replaced objects still awaiting deletion.
    #[serde(default)]
    pub deposed: Vec<String>,
    /// When the object was created.
    pub created_at: DateTime<Utc>,
    /// When the object was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Serial the state reaches once this record is applied.
    pub serial: u64,
    /// Lineage of the state the record belongs to.
    pub lineage: String,
    /// When the mutation was committed.
    pub at: DateTime<Utc>,
    /// The mutation itself.
    pub change: JournalChange,
}

/// Mutation kinds recorded in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalChange {
    /// Instance state written.
    Put {
        /// Instance address.
        instance: InstanceId,
        /// New state.
        state: InstanceState,
        /// Clears any taint marker.
        #[serde(default)]
        clear_taint: bool,
    },
    /// Instance no longer exists.
    Remove {
        /// Instance address.
        instance: InstanceId,
    },
    /// Instance marked for replacement.
    Taint {
        /// Instance address.
        instance: InstanceId,
    },
    /// Taint marker cleared.
    Untaint {
        /// Instance address.
        instance: InstanceId,
    },
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Configuration hash the run applied, empty for refreshes.
    #[serde(default)]
    pub config_hash: String,
    /// Operations completed.
    #[serde(default)]
    pub completed: usize,
    /// Operations failed.
    #[serde(default)]
    pub failed: usize,
    /// Operations skipped.
    #[serde(default)]
    pub skipped: usize,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Plan applied.
    Apply,
    /// State refreshed from the provider.
    Refresh,
    /// Manual state edit (taint, untaint).
    StateEdit,
}

impl StateSnapshot {
    /// Creates a new empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            instances: BTreeMap::new(),
            tainted: BTreeSet::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Rejects snapshots written by a newer major format version.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` if the major version is newer.
    pub fn check_version(&self) -> Result<(), StateError> {
        let major = |v: &str| v.split('.').next().and_then(|m| m.parse::<u32>().ok());
        match (major(&self.version), major(STATE_VERSION)) {
            (Some(found), Some(supported)) if found <= supported => Ok(()),
            _ => Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            }),
        }
    }

    /// Gets an instance by address.
    #[must_use]
    pub fn get(&self, id: &InstanceId) -> Option<&InstanceState> {
        self.instances.get(id)
    }

    /// Returns true if the instance is tainted.
    #[must_use]
    pub fn is_tainted(&self, id: &InstanceId) -> bool {
        self.tainted.contains(id)
    }

    /// Applies one mutation in memory.
    pub fn apply_change(&mut self, change: &JournalChange) {
        match change {
            JournalChange::Put {
                instance,
                state,
                clear_taint,
            } => {
                self.instances.insert(instance.clone(), state.clone());
                if *clear_taint {
                    self.tainted.remove(instance);
                }
            }
            JournalChange::Remove { instance } => {
                self.instances.remove(instance);
                self.tainted.remove(instance);
            }
            JournalChange::Taint { instance } => {
                self.tainted.insert(instance.clone());
            }
            JournalChange::Untaint { instance } => {
                self.tainted.remove(instance);
            }
        }
        self.last_updated = Utc::now();
    }

    /// Replays journal records newer than the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if a record belongs to another lineage or the
    /// serials have a gap.
    pub fn replay(&mut self, records: &[JournalRecord]) -> Result<usize, StateError> {
        let mut applied = 0;
        for record in records {
            if record.lineage != self.lineage {
                return Err(StateError::corrupted(format!(
                    "journal record {} belongs to lineage {}, state is {}",
                    record.serial, record.lineage, self.lineage
                )));
            }
            if record.serial <= self.serial {
                continue;
            }
            if record.serial != self.serial + 1 {
                return Err(StateError::corrupted(format!(
                    "journal jumps from serial {} to {}",
                    self.serial, record.serial
                )));
            }
            self.apply_change(&record.change);
            self.serial = record.serial;
            applied += 1;
        }
        Ok(applied)
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceState {
    /// Creates a new instance state.
    #[must_use]
    pub fn new(id: &InstanceId, provider_id: impl Into<String>, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            resource_type: id.resource_type.clone(),
            id: provider_id.into(),
            attributes,
            dependencies: Vec::new(),
            create_before_destroy: false,
            deposed: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<InstanceId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Returns true if every attribute is a concrete value.
    #[must_use]
    pub fn is_fully_known(&self) -> bool {
        self.attributes.values().all(crate::schema::Value::is_known)
    }
}

impl JournalChange {
    /// Address of the instance the change touches.
    #[must_use]
    pub const fn instance(&self) -> &InstanceId {
        match self {
            Self::Put { instance, .. }
            | Self::Remove { instance }
            | Self::Taint { instance }
            | Self::Untaint { instance } => instance,
        }
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: RunOperation, config_hash: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            completed: 0,
            failed: 0,
            skipped: 0,
            success: true,
            error: None,
        }
    }

    /// Records operation counts.
    #[must_use]
    pub const fn with_counts(mut self, completed: usize, failed: usize, skipped: usize) -> Self {
        self.completed = completed;
        self.failed = failed;
        self.skipped = skipped;
        self.success = failed == 0 && skipped == 0;
        self
    }

    /// Marks the run failed.
    #[must_use]
    pub fn failed(mut self, error: &str) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Refresh => "refresh",
            Self::StateEdit => "state-edit",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Value;

    fn put(serial: u64, lineage: &str, name: &str) -> JournalRecord {
        let id = InstanceId::new("network", name);
        let mut attributes = Attributes::new();
        attributes.insert(String::from("cidr"), Value::string("10.0.0.0/16"));
        JournalRecord {
            serial,
            lineage: lineage.to_string(),
            at: Utc::now(),
            change: JournalChange::Put {
                state: InstanceState::new(&id, format!("net-{serial}"), attributes),
                instance: id,
                clear_taint: true,
            },
        }
    }

    #[test]
    fn test_replay_applies_newer_records() {
        let mut snapshot = StateSnapshot::new();
        let lineage = snapshot.lineage.clone();
        let records = vec![put(1, &lineage, "a"), put(2, &lineage, "b")];

        let applied = snapshot.replay(&records).expect("replay");
        assert_eq!(applied, 2);
        assert_eq!(snapshot.serial, 2);
        assert_eq!(snapshot.instances.len(), 2);

        // Replaying the same records is a no-op.
        assert_eq!(snapshot.replay(&records).expect("replay"), 0);
    }

    #[test]
    fn test_replay_rejects_foreign_lineage() {
        let mut snapshot = StateSnapshot::new();
        let err = snapshot
            .replay(&[put(1, "someone-else", "a")])
            .expect_err("foreign lineage");
        assert!(matches!(err, StateError::Corrupted { .. }));
    }

    #[test]
    fn test_taint_markers() {
        let mut snapshot = StateSnapshot::new();
        let id = InstanceId::new("server", "web");
        snapshot.apply_change(&JournalChange::Taint {
            instance: id.clone(),
        });
        assert!(snapshot.is_tainted(&id));
        snapshot.apply_change(&JournalChange::Untaint {
            instance: id.clone(),
        });
        assert!(!snapshot.is_tainted(&id));
    }

    #[test]
    fn test_version_check() {
        let mut snapshot = StateSnapshot::new();
        assert!(snapshot.check_version().is_ok());
        snapshot.version = String::from("2.0");
        assert!(matches!(
            snapshot.check_version(),
            Err(StateError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new();
        for _ in 0..(MAX_HISTORY + 5) {
            snapshot.add_history(RunHistoryEntry::new(RunOperation::Apply, "abc"));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_snapshot_json_roundtrip_ignores_unknown_fields() {
        let snapshot = StateSnapshot::new();
        let mut json: serde_json::Value = serde_json::to_value(&snapshot).expect("serialize");
        json["added_later"] = serde_json::json!(true);
        let back: StateSnapshot = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, snapshot);
    }
}
