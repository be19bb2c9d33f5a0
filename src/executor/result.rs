//! Outcome of applying a plan.

use serde::Serialize;
use std::fmt;

use crate::error::ApplyError;
use crate::planner::OperationKind;
use crate::schema::InstanceId;

/// A completed operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    /// Plan index.
    pub index: usize,
    /// Instance address.
    pub instance: InstanceId,
    /// Provider call.
    pub kind: OperationKind,
    /// Provider calls made, zero if none was needed.
    pub attempts: u32,
    /// Additional detail (new provider id, "no changes left", ...).
    pub note: Option<String>,
}

/// A failed operation.
#[derive(Debug, Serialize)]
pub struct FailedOperation {
    /// Plan index.
    pub index: usize,
    /// Instance address.
    pub instance: InstanceId,
    /// Provider call.
    pub kind: OperationKind,
    /// Provider calls made.
    pub attempts: u32,
    /// Error message.
    pub message: String,
    /// Underlying error.
    #[serde(skip)]
    pub cause: ApplyError,
}

/// Why an operation was never attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// An operation it depends on failed.
    DependencyFailed {
        /// Instance whose operation failed.
        instance: InstanceId,
    },
    /// The run was cancelled before it started.
    Cancelled,
    /// The run stopped on a fatal error.
    Aborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed { instance } => write!(f, "dependency {instance} failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Aborted => write!(f, "run aborted"),
        }
    }
}

/// An operation that was never attempted.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedOperation {
    /// Plan index.
    pub index: usize,
    /// Instance address.
    pub instance: InstanceId,
    /// Provider call.
    pub kind: OperationKind,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// Result of applying a plan.
#[derive(Debug, Default, Serialize)]
pub struct ApplyResult {
    /// Operations that succeeded, in completion order.
    pub completed: Vec<OperationReport>,
    /// Operations that failed.
    pub failed: Vec<FailedOperation>,
    /// Operations never attempted.
    pub skipped: Vec<SkippedOperation>,
    /// The run was cancelled.
    pub cancelled: bool,
    /// Serial of the finalized state.
    pub serial: Option<u64>,
}

impl ApplyResult {
    /// Returns true if every operation completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && !self.cancelled
    }

    /// Completed operations for one instance.
    #[must_use]
    pub fn completed_for(&self, instance: &InstanceId) -> Vec<&OperationReport> {
        self.completed
            .iter()
            .filter(|r| &r.instance == instance)
            .collect()
    }

    /// Returns true if the instance has a skipped operation.
    #[must_use]
    pub fn was_skipped(&self, instance: &InstanceId) -> bool {
        self.skipped.iter().any(|s| &s.instance == instance)
    }

    /// Returns true if the instance has a failed operation.
    #[must_use]
    pub fn has_failed(&self, instance: &InstanceId) -> bool {
        self.failed.iter().any(|f| &f.instance == instance)
    }
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} skipped",
            self.completed.len(),
            self.failed.len(),
            self.skipped.len()
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}
