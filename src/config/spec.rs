//! Manifest types.
//!
//! This module defines the structs that map to the `converge.yaml` file.
//! Resource attributes stay untyped here; the validator converts them
//! through the schema registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The root structure of a `converge.yaml` manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or memory).
    #[serde(default)]
    pub backend: StateBackend,
    /// State directory for the local backend.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Directory holding snapshot, journal and lock file.
    #[default]
    Local,
    /// Process memory; nothing survives the run.
    Memory,
}

/// Executor tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum concurrent provider operations.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Attempts per operation for transient provider errors.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on a single retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// One declared resource instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type name.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name, unique per type.
    pub name: String,
    /// Raw attribute values.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
    /// Explicit dependencies as `type.name` addresses.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle overrides.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Per-instance lifecycle overrides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LifecycleConfig {
    /// Overrides the type's create-before-destroy flag.
    #[serde(default)]
    pub create_before_destroy: Option<bool>,
}

// Default value functions

const fn default_parallelism() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_environment() -> String {
    String::from("dev")
}

/// Default local state directory.
pub const DEFAULT_STATE_DIR: &str = ".converge";

impl Manifest {
    /// Returns `type.name` addresses of declared resources.
    #[must_use]
    pub fn resource_addresses(&self) -> Vec<String> {
        self.resources.iter().map(ResourceConfig::address).collect()
    }
}

impl StateConfig {
    /// Local state directory, relative paths resolved against `base`.
    #[must_use]
    pub fn directory(&self, base: &std::path::Path) -> PathBuf {
        let path = PathBuf::from(self.path.as_deref().unwrap_or(DEFAULT_STATE_DIR));
        if path.is_absolute() {
            path
        } else {
            base.join(path)
        }
    }
}

impl ResourceConfig {
    /// Returns the `type.name` address.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let manifest: Manifest = serde_yaml::from_str("project:\n  name: demo\n").expect("parse");
        assert_eq!(manifest.project.environment, "dev");
        assert_eq!(manifest.state.backend, StateBackend::Local);
        assert_eq!(manifest.engine, EngineConfig::default());
        assert_eq!(manifest.engine.parallelism, 4);
        assert!(manifest.resources.is_empty());
    }

    #[test]
    fn test_resource_lifecycle() {
        let yaml = r#"
project:
  name: demo
resources:
  - type: server
    name: web
    attributes:
      image: ubuntu-24.04
    lifecycle:
      create_before_destroy: false
"#;
        let manifest: Manifest = serde_yaml::from_str(yaml).expect("parse");
        let resource = &manifest.resources[0];
        assert_eq!(resource.address(), "server.web");
        assert_eq!(resource.lifecycle.create_before_destroy, Some(false));
        assert_eq!(manifest.resource_addresses(), vec!["server.web"]);
    }

    #[test]
    fn test_state_directory() {
        let config = StateConfig::default();
        let dir = config.directory(std::path::Path::new("/work"));
        assert_eq!(dir, PathBuf::from("/work/.converge"));
    }
}
