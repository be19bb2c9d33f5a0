//! Manifest parser for loading configuration files.
//!
//! This module handles loading the manifest from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::Path;
use tracing::{debug, info};

use super::spec::Manifest;

/// Manifest parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads the manifest from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Manifest> {
        let path = path.as_ref();
        info!("Loading manifest from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses the manifest from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Manifest> {
        debug!("Parsing YAML manifest");

        let manifest: Manifest = serde_yaml::from_str(content).map_err(|e| {
            let location = source
                .map(|p| p.display().to_string())
                .or_else(|| e.location().map(|l| format!("line {}, column {}", l.line(), l.column())));
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed manifest for project {} with {} resource(s)",
            manifest.project.name,
            manifest.resources.len()
        );
        Ok(manifest)
    }

    /// Loads the manifest with environment variable overrides.
    ///
    /// Environment variables are checked in the format:
    /// `CONVERGE_<SECTION>_<KEY>` (e.g., `CONVERGE_PROJECT_NAME`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// does not parse.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Manifest> {
        let mut manifest = self.load_file(path)?;
        Self::apply_overrides(&mut manifest, |key| std::env::var(key).ok())?;
        Ok(manifest)
    }

    /// Applies overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a numeric override does not parse.
    pub fn apply_overrides(
        manifest: &mut Manifest,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        // Project overrides
        if let Some(name) = lookup("CONVERGE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            manifest.project.name = name;
        }

        if let Some(env) = lookup("CONVERGE_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            manifest.project.environment = env;
        }

        // State overrides
        if let Some(path) = lookup("CONVERGE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            manifest.state.path = Some(path);
        }

        // Engine overrides
        if let Some(raw) = lookup("CONVERGE_PARALLELISM") {
            debug!("Overriding engine.parallelism from environment");
            manifest.engine.parallelism = raw.trim().parse().map_err(|_| {
                ConfigError::validation(
                    format!("CONVERGE_PARALLELISM must be a positive integer, got '{raw}'"),
                    "engine.parallelism",
                )
            })?;
        }

        if let Some(raw) = lookup("CONVERGE_MAX_ATTEMPTS") {
            debug!("Overriding engine.max_attempts from environment");
            manifest.engine.max_attempts = raw.trim().parse().map_err(|_| {
                ConfigError::validation(
                    format!("CONVERGE_MAX_ATTEMPTS must be a positive integer, got '{raw}'"),
                    "engine.max_attempts",
                )
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default manifest file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml"];

/// Finds the manifest in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no manifest is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found manifest: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_manifest() {
        let yaml = r"
project:
  name: test-project
state:
  backend: memory
resources: []
";
        let parser = ConfigParser::new();
        let manifest = parser.parse_yaml(yaml, None).expect("Failed to parse");

        assert_eq!(manifest.project.name, "test-project");
        assert_eq!(manifest.project.environment, "dev");
        assert_eq!(manifest.state.backend, StateBackend::Memory);
    }

    #[test]
    fn test_parse_full_manifest() {
        let yaml = r#"
project:
  name: web-stack
  environment: prod

state:
  backend: local
  path: .state

engine:
  parallelism: 8
  max_attempts: 3

resources:
  - type: network
    name: main
    attributes:
      cidr: 10.0.0.0/16
  - type: server
    name: web
    attributes:
      image: ubuntu-24.04
      network_id: "${network.main.id}"
    depends_on: [network.main]
"#;
        let parser = ConfigParser::new();
        let manifest = parser.parse_yaml(yaml, None).expect("Failed to parse");

        assert_eq!(manifest.project.name, "web-stack");
        assert_eq!(manifest.engine.parallelism, 8);
        assert_eq!(manifest.engine.max_attempts, 3);
        assert_eq!(manifest.engine.initial_backoff_ms, 200);
        assert_eq!(manifest.resources.len(), 2);
        assert_eq!(manifest.resources[1].depends_on, vec!["network.main"]);
    }

    #[test]
    fn test_parse_error_reports_location() {
        let parser = ConfigParser::new();
        let err = parser
            .parse_yaml("project: [unclosed", None)
            .expect_err("invalid yaml");
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let parser = ConfigParser::new();
        let mut manifest = parser
            .parse_yaml("project:\n  name: demo\n", None)
            .expect("Failed to parse");

        let vars: HashMap<&str, &str> = [
            ("CONVERGE_PROJECT_ENVIRONMENT", "staging"),
            ("CONVERGE_PARALLELISM", "2"),
        ]
        .into_iter()
        .collect();
        ConfigParser::apply_overrides(&mut manifest, |key| vars.get(key).map(ToString::to_string))
            .expect("overrides");

        assert_eq!(manifest.project.environment, "staging");
        assert_eq!(manifest.engine.parallelism, 2);

        let result = ConfigParser::apply_overrides(&mut manifest, |key| {
            (key == "CONVERGE_MAX_ATTEMPTS").then(|| String::from("many"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("converge.yaml"), "project:\n  name: x\n")
            .expect("write manifest");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("create nested");

        let found = find_config_file(&nested).expect("manifest found");
        assert_eq!(found, dir.path().join("converge.yaml"));
    }
}
