//! Schema registry.
//!
//! Maps a resource type name to its schema and adapter. Built once at
//! start-up through [`SchemaRegistry::builder`] and shared behind an `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::types::{InstanceId, ResourceType};
use crate::error::ConfigError;
use crate::provider::ResourceAdapter;

/// A resource type together with the adapter that manages it.
#[derive(Clone)]
pub struct RegisteredType {
    /// Attribute schema.
    pub schema: Arc<ResourceType>,
    /// CRUD implementation.
    pub adapter: Arc<dyn ResourceAdapter>,
}

impl fmt::Debug for RegisteredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredType")
            .field("schema", &self.schema.name)
            .finish_non_exhaustive()
    }
}

/// Immutable catalogue of resource types.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: BTreeMap<String, RegisteredType>,
}

/// Builder collecting registrations before the registry is frozen.
#[derive(Default)]
pub struct SchemaRegistryBuilder {
    entries: Vec<(ResourceType, Arc<dyn ResourceAdapter>)>,
}

impl SchemaRegistryBuilder {
    /// Registers a resource type with its adapter.
    #[must_use]
    pub fn register(mut self, schema: ResourceType, adapter: Arc<dyn ResourceAdapter>) -> Self {
        self.entries.push((schema, adapter));
        self
    }

    /// Freezes the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a type name is registered twice.
    pub fn build(self) -> Result<SchemaRegistry, ConfigError> {
        let mut types = BTreeMap::new();
        for (schema, adapter) in self.entries {
            if types.contains_key(&schema.name) {
                return Err(ConfigError::validation_general(format!(
                    "resource type '{}' registered twice",
                    schema.name
                )));
            }
            debug!(resource_type = %schema.name, "Registered resource type");
            types.insert(
                schema.name.clone(),
                RegisteredType {
                    schema: Arc::new(schema),
                    adapter,
                },
            );
        }
        Ok(SchemaRegistry { types })
    }
}

impl SchemaRegistry {
    /// Starts a new registry.
    #[must_use]
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Looks up a type.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<&RegisteredType> {
        self.types.get(resource_type)
    }

    /// Looks up the type of `instance`, failing if it is unknown.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResourceType` if nothing is registered for the type.
    pub fn require(&self, instance: &InstanceId) -> Result<&RegisteredType, ConfigError> {
        self.get(&instance.resource_type)
            .ok_or_else(|| ConfigError::UnknownResourceType {
                resource_type: instance.resource_type.clone(),
                instance: instance.to_string(),
            })
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockResourceAdapter;
    use crate::schema::types::{AttributeKind, AttributeSchema};

    fn network() -> ResourceType {
        ResourceType::new("network")
            .with_attribute(AttributeSchema::required("cidr", AttributeKind::string()).force_new())
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SchemaRegistry::builder()
            .register(network(), Arc::new(MockResourceAdapter::new()))
            .build()
            .expect("registry");

        assert_eq!(registry.len(), 1);
        assert!(registry.get("network").is_some());
        assert!(registry.get("server").is_none());

        let found = registry
            .require(&InstanceId::new("network", "main"))
            .expect("registered");
        assert!(found.schema.attribute("cidr").is_some());
    }

    #[test]
    fn test_unknown_type() {
        let registry = SchemaRegistry::builder().build().expect("registry");
        let err = registry
            .require(&InstanceId::new("bucket", "logs"))
            .expect_err("unknown type");
        assert!(matches!(err, ConfigError::UnknownResourceType { .. }));
    }

    #[test]
    fn test_duplicate_registration() {
        let result = SchemaRegistry::builder()
            .register(network(), Arc::new(MockResourceAdapter::new()))
            .register(network(), Arc::new(MockResourceAdapter::new()))
            .build();
        assert!(result.is_err());
    }
}
