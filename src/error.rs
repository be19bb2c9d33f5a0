//! Error types for the Halldyll converge engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, dependency graph construction, state persistence,
//! provider calls, planning and apply.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors surfaced outside of an apply (refresh, drift checks).
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A resource uses a type that no adapter is registered for.
    #[error("Unknown resource type '{resource_type}' for {instance}")]
    UnknownResourceType {
        /// The unregistered type name.
        resource_type: String,
        /// Instance that referenced the type.
        instance: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource definition: {instance}")]
    DuplicateName {
        /// The duplicated instance address.
        instance: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The references between resources form a cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Instances on the cycle, first element repeated at the end.
        path: Vec<String>,
    },

    /// A resource references an instance that is not declared.
    #[error("{from} references undeclared instance {to}")]
    UnknownReference {
        /// Instance holding the reference.
        from: String,
        /// Referenced instance address.
        to: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// The backing medium cannot be read or written.
    #[error("State store unavailable: {message}")]
    StoreUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// Another run holds the state lock.
    #[error("State is locked by another run (lock holder: {holder}, since: {since})")]
    ConcurrentModification {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The run's lock expired or was removed while it was still working.
    #[error("State lock {lock_id} is no longer held by this run")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State written by an incompatible engine version.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Supported state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// Journal or plan belongs to a different state lineage.
    #[error("State lineage mismatch: expected {expected}, found {found}")]
    LineageMismatch {
        /// Expected lineage.
        expected: String,
        /// Found lineage.
        found: String,
    },

    /// An instance address is unknown to the state.
    #[error("Instance not found in state: {instance}")]
    InstanceNotFound {
        /// The instance address.
        instance: String,
    },
}

/// Errors returned by resource adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Provider throttled the request.
    #[error("Provider rate limited the request")]
    RateLimited {
        /// Delay suggested by the provider, in milliseconds.
        retry_after_ms: Option<u64>,
    },

    /// The provider call timed out.
    #[error("Provider call timed out: {message}")]
    Timeout {
        /// Description of the timeout.
        message: String,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Credentials lack permission for the call.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Description of the denial.
        message: String,
    },

    /// Object does not exist on the provider.
    #[error("Object not found: {id}")]
    NotFound {
        /// Provider identifier of the missing object.
        id: String,
    },

    /// Provider rejected the request payload.
    #[error("Provider rejected configuration: {message}")]
    Validation {
        /// Description of the rejection.
        message: String,
    },

    /// API request failed.
    #[error("Provider API request failed: {status} - {message}")]
    ApiRequestFailed {
        /// Status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The state changed since the plan was computed.
    #[error("Plan is stale: planned against serial {planned_serial}, state is at serial {current_serial}")]
    StalePlan {
        /// Serial the plan was built from.
        planned_serial: u64,
        /// Serial of the stored state.
        current_serial: u64,
    },

    /// Conflicting operations in plan.
    #[error("Conflicting operations in plan: {message}")]
    ConflictingOperations {
        /// Description of the conflict.
        message: String,
    },
}

/// Per-operation apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The provider call failed for good.
    #[error("Operation on {instance} failed after {attempts} attempt(s): {source}")]
    OperationFailed {
        /// Instance address.
        instance: String,
        /// Number of provider calls made.
        attempts: u32,
        /// Final provider error.
        #[source]
        source: ProviderError,
    },

    /// A reference could not be resolved once its producer had applied.
    #[error("Unresolved reference in {instance}: {reference}")]
    UnresolvedReference {
        /// Instance holding the reference.
        instance: String,
        /// Reference that stayed unknown.
        reference: String,
    },

    /// The instance expected by the operation is missing from state.
    #[error("Instance {instance} is missing from state")]
    MissingState {
        /// Instance address.
        instance: String,
    },
}

/// Result type alias for converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error must stop the whole run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Apply(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a store-unavailable error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an API request error.
    #[must_use]
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::NetworkError { .. }
        )
    }

    /// Returns the delay requested by the provider, if any.
    #[must_use]
    pub const fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}
