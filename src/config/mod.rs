//! Configuration module for the converge engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `converge.yaml`
//! - Validation against the schema registry into a typed desired state
//! - Computing configuration hashes for change detection

mod desired;
mod hash;
mod parser;
mod spec;
mod validator;

pub use desired::{DesiredInstance, DesiredState};
pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    DEFAULT_STATE_DIR, EngineConfig, LifecycleConfig, Manifest, ProjectConfig, ResourceConfig,
    StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, IssueKind, ValidationIssue, ValidationResult};
