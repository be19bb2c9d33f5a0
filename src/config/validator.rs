//! Manifest validation.
//!
//! Checks the manifest against the schema registry and converts every
//! resource into a typed [`DesiredInstance`]. All problems are collected
//! before anything is returned so a user sees the whole list at once.

use crate::error::{ConfigError, ConvergeError, Result};
use crate::schema::{InstanceId, Presence, SchemaRegistry, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::desired::{DesiredInstance, DesiredState};
use super::spec::{EngineConfig, Manifest, ProjectConfig, ResourceConfig, StateBackend, StateConfig};

/// Validator for manifests.
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    /// Registered resource types.
    registry: Arc<SchemaRegistry>,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationIssue>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
    /// Typed desired state for every resource that converted cleanly.
    pub desired: DesiredState,
}

/// A single validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
    /// Category, used to pick the returned error variant.
    pub kind: IssueKind,
}

/// Category of a validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    /// A value or structure is invalid.
    Invalid,
    /// The resource type is not registered.
    UnknownType {
        /// Unregistered type name.
        resource_type: String,
        /// Address of the offending resource.
        instance: String,
    },
    /// The address is declared twice.
    Duplicate {
        /// Duplicated address.
        instance: String,
    },
}

impl ValidationIssue {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            kind: IssueKind::Invalid,
        }
    }

    /// Converts the issue into the matching configuration error.
    #[must_use]
    pub fn to_error(&self) -> ConfigError {
        match &self.kind {
            IssueKind::Invalid => ConfigError::validation(self.message.clone(), self.field.clone()),
            IssueKind::UnknownType {
                resource_type,
                instance,
            } => ConfigError::UnknownResourceType {
                resource_type: resource_type.clone(),
                instance: instance.clone(),
            },
            IssueKind::Duplicate { instance } => ConfigError::DuplicateName {
                instance: instance.clone(),
            },
        }
    }
}

impl ConfigValidator {
    /// Creates a validator backed by `registry`.
    #[must_use]
    pub const fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Validates a manifest, failing on the first collected error.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self, manifest: &Manifest) -> Result<ValidationResult> {
        let result = self.check(manifest);

        if let Some(first_error) = result.errors.first() {
            return Err(ConvergeError::Config(first_error.to_error()));
        }

        debug!("Manifest validation passed");
        Ok(result)
    }

    /// Validates a manifest and returns only the typed desired state.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn desired_state(&self, manifest: &Manifest) -> Result<DesiredState> {
        self.validate(manifest).map(|result| result.desired)
    }

    /// Runs every check and collects the findings.
    #[must_use]
    pub fn check(&self, manifest: &Manifest) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&manifest.project, &mut result);
        Self::validate_state(&manifest.state, &mut result);
        Self::validate_engine(&manifest.engine, &mut result);
        self.validate_resources(&manifest.resources, &mut result);
        self.validate_references(&mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        // Project name must be valid
        if project.name.is_empty() {
            result.errors.push(ValidationIssue::invalid(
                "project.name",
                "Project name cannot be empty",
            ));
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationIssue::invalid(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            ));
        }

        // Environment must be valid
        if project.environment.is_empty() {
            result.errors.push(ValidationIssue::invalid(
                "project.environment",
                "Environment cannot be empty",
            ));
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::Local => {
                if state.path.as_ref().is_some_and(|p| p.trim().is_empty()) {
                    result.errors.push(ValidationIssue::invalid(
                        "state.path",
                        "State path cannot be empty",
                    ));
                }
            }
            StateBackend::Memory => {
                result.warnings.push(String::from(
                    "state.backend: memory state is discarded when the process exits",
                ));
            }
        }
    }

    /// Validates engine tuning.
    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.parallelism == 0 {
            result.errors.push(ValidationIssue::invalid(
                "engine.parallelism",
                "Parallelism must be at least 1",
            ));
        }

        if engine.max_attempts == 0 {
            result.errors.push(ValidationIssue::invalid(
                "engine.max_attempts",
                "Max attempts must be at least 1",
            ));
        }

        if engine.initial_backoff_ms > engine.max_backoff_ms {
            result.errors.push(ValidationIssue::invalid(
                "engine.initial_backoff_ms",
                format!(
                    "Initial backoff ({} ms) exceeds max backoff ({} ms)",
                    engine.initial_backoff_ms, engine.max_backoff_ms
                ),
            ));
        }

        if engine.parallelism > 64 {
            result.warnings.push(format!(
                "engine.parallelism: {} concurrent operations may trip provider rate limits",
                engine.parallelism
            ));
        }
    }

    /// Validates and converts all resources.
    fn validate_resources(&self, resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined; every managed instance will be destroyed"));
            return;
        }

        let mut seen = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");
            let address = resource.address();

            // Validate resource name format
            if !is_valid_identifier(&resource.name) {
                result.errors.push(ValidationIssue::invalid(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must start with a letter and contain only lowercase letters, digits, '-' or '_'.",
                        resource.name
                    ),
                ));
                continue;
            }

            // Validate unique address
            if !seen.insert(address.clone()) {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate resource: {address}"),
                    kind: IssueKind::Duplicate {
                        instance: address.clone(),
                    },
                });
                continue;
            }

            if let Some(instance) = self.convert_resource(resource, &prefix, result) {
                // Address uniqueness was checked above.
                let _ = result.desired.push(instance);
            }
        }
    }

    /// Converts one resource through its schema.
    fn convert_resource(
        &self,
        resource: &ResourceConfig,
        prefix: &str,
        result: &mut ValidationResult,
    ) -> Option<DesiredInstance> {
        let id = InstanceId::new(&resource.resource_type, &resource.name);
        let Some(registered) = self.registry.get(&resource.resource_type) else {
            result.errors.push(ValidationIssue {
                field: format!("{prefix}.type"),
                message: format!(
                    "Unknown resource type '{}'. Registered types: {}",
                    resource.resource_type,
                    self.registry.type_names().collect::<Vec<_>>().join(", ")
                ),
                kind: IssueKind::UnknownType {
                    resource_type: resource.resource_type.clone(),
                    instance: id.to_string(),
                },
            });
            return None;
        };
        let schema = &registered.schema;
        let errors_before = result.errors.len();
        let mut attributes = crate::schema::Attributes::new();

        for (key, raw) in &resource.attributes {
            let field = format!("{prefix}.attributes.{key}");
            let Some(attribute) = schema.attribute(key) else {
                result.errors.push(ValidationIssue::invalid(
                    field,
                    format!("Unknown attribute '{key}' for type '{}'", schema.name),
                ));
                continue;
            };

            if !attribute.is_settable() {
                result.errors.push(ValidationIssue::invalid(
                    field,
                    format!("Attribute '{key}' is computed by the provider and cannot be set"),
                ));
                continue;
            }

            match Value::from_yaml(raw, &attribute.kind) {
                Ok(Value::Null) => {}
                Ok(value) => {
                    attributes.insert(key.clone(), value);
                }
                Err(message) => result.errors.push(ValidationIssue::invalid(field, message)),
            }
        }

        for attribute in schema.attributes() {
            if attributes.contains_key(&attribute.name) {
                continue;
            }
            if let Some(default) = &attribute.default {
                attributes.insert(attribute.name.clone(), default.clone());
            } else if attribute.presence == Presence::Required {
                result.errors.push(ValidationIssue::invalid(
                    format!("{prefix}.attributes.{}", attribute.name),
                    format!("Missing required attribute '{}'", attribute.name),
                ));
            }
        }

        let mut depends_on = Vec::new();
        for (j, raw) in resource.depends_on.iter().enumerate() {
            match raw.parse::<InstanceId>() {
                Ok(target) => depends_on.push(target),
                Err(message) => result
                    .errors
                    .push(ValidationIssue::invalid(format!("{prefix}.depends_on[{j}]"), message)),
            }
        }

        if resource.lifecycle.create_before_destroy.is_some() && !schema.has_force_new() {
            result.warnings.push(format!(
                "{prefix}.lifecycle.create_before_destroy: type '{}' is never replaced, the setting has no effect",
                schema.name
            ));
        }

        (result.errors.len() == errors_before).then(|| DesiredInstance {
            id,
            attributes,
            depends_on,
            create_before_destroy: resource.lifecycle.create_before_destroy,
        })
    }

    /// Checks that references and explicit dependencies point at declared
    /// instances and existing attributes.
    fn validate_references(&self, result: &mut ValidationResult) {
        let mut issues = Vec::new();

        for instance in result.desired.iter() {
            for reference in instance.references() {
                let field = format!("{}", instance.id);
                if reference.target == instance.id {
                    issues.push(ValidationIssue::invalid(
                        field,
                        format!("{reference} refers to the instance itself"),
                    ));
                    continue;
                }
                if !result.desired.contains(&reference.target) {
                    issues.push(ValidationIssue::invalid(
                        field,
                        format!("{reference} refers to undeclared instance {}", reference.target),
                    ));
                    continue;
                }
                let head = reference.path().first().copied().unwrap_or_default();
                let known_attribute = head == "id"
                    || self
                        .registry
                        .get(&reference.target.resource_type)
                        .is_some_and(|t| t.schema.attribute(head).is_some());
                if !known_attribute {
                    issues.push(ValidationIssue::invalid(
                        field,
                        format!(
                            "{reference}: type '{}' has no attribute '{head}'",
                            reference.target.resource_type
                        ),
                    ));
                }
            }

            for target in &instance.depends_on {
                if target == &instance.id {
                    issues.push(ValidationIssue::invalid(
                        instance.id.to_string(),
                        "depends_on lists the instance itself",
                    ));
                } else if !result.desired.contains(target) {
                    issues.push(ValidationIssue::invalid(
                        instance.id.to_string(),
                        format!("depends_on refers to undeclared instance {target}"),
                    ));
                }
            }
        }

        result.errors.extend(issues);
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase() {
            return false;
        }

    // Rest must be lowercase alphanumeric or hyphen
    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    // Cannot end with hyphen
    if name.ends_with('-') {
        return false;
    }

    // Cannot have consecutive hyphens
    if name.contains("--") {
        return false;
    }

    true
}

/// Resource names additionally allow underscores and never contain dots.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
