//! Typed desired state produced by validation.

use std::collections::{BTreeSet, HashMap};

use tracing::warn;

use crate::error::ConfigError;
use crate::schema::{Attributes, InstanceId, Reference};

/// Desired configuration of one instance after schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredInstance {
    /// Instance address.
    pub id: InstanceId,
    /// Typed attributes, defaults applied, references unresolved.
    pub attributes: Attributes,
    /// Explicit dependencies.
    pub depends_on: Vec<InstanceId>,
    /// Per-instance override of the type's create-before-destroy flag.
    pub create_before_destroy: Option<bool>,
}

impl DesiredInstance {
    /// All references held by the attributes.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        for value in self.attributes.values() {
            value.collect_references(&mut out);
        }
        out
    }

    /// Every instance this one depends on, through references or `depends_on`.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<InstanceId> {
        self.references()
            .into_iter()
            .map(|r| r.target.clone())
            .chain(self.depends_on.iter().cloned())
            .filter(|id| id != &self.id)
            .collect()
    }
}

/// All desired instances, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredState {
    instances: Vec<DesiredInstance>,
    index: HashMap<InstanceId, usize>,
}

impl DesiredState {
    /// Creates an empty desired state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an instance.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if the address is already declared.
    pub fn push(&mut self, instance: DesiredInstance) -> Result<(), ConfigError> {
        if self.index.contains_key(&instance.id) {
            return Err(ConfigError::DuplicateName {
                instance: instance.id.to_string(),
            });
        }
        self.index.insert(instance.id.clone(), self.instances.len());
        self.instances.push(instance);
        Ok(())
    }

    /// Looks up an instance.
    #[must_use]
    pub fn get(&self, id: &InstanceId) -> Option<&DesiredInstance> {
        self.index.get(id).map(|&i| &self.instances[i])
    }

    /// Returns true if `id` is declared.
    #[must_use]
    pub fn contains(&self, id: &InstanceId) -> bool {
        self.index.contains_key(id)
    }

    /// Declaration position of `id`.
    #[must_use]
    pub fn position(&self, id: &InstanceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Iterates in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &DesiredInstance> {
        self.instances.iter()
    }

    /// Number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl FromIterator<DesiredInstance> for DesiredState {
    /// Collects instances, keeping the first of any duplicated address.
    ///
    /// Use [`DesiredState::push`] when duplicates must be reported; a
    /// duplicate here is logged and fails debug builds.
    fn from_iter<T: IntoIterator<Item = DesiredInstance>>(iter: T) -> Self {
        let mut state = Self::new();
        for instance in iter {
            let id = instance.id.clone();
            let pushed = state.push(instance);
            if pushed.is_err() {
                warn!(instance = %id, "Duplicate instance dropped");
            }
            debug_assert!(pushed.is_ok(), "{id} declared twice");
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Value;

    #[test]
    fn test_dependencies_merge_references_and_depends_on() {
        let mut attributes = Attributes::new();
        attributes.insert(
            String::from("network_id"),
            Value::Reference(Reference::parse("${network.main.id}").expect("reference")),
        );
        let instance = DesiredInstance {
            id: InstanceId::new("server", "web"),
            attributes,
            depends_on: vec![InstanceId::new("volume", "data")],
            create_before_destroy: None,
        };

        let deps: Vec<String> = instance.dependencies().iter().map(ToString::to_string).collect();
        assert_eq!(deps, vec!["network.main", "volume.data"]);
    }

    #[test]
    fn test_push_rejects_duplicates() {
        let instance = DesiredInstance {
            id: InstanceId::new("network", "main"),
            attributes: Attributes::new(),
            depends_on: vec![],
            create_before_destroy: None,
        };
        let mut state = DesiredState::new();
        state.push(instance.clone()).expect("first push");
        assert!(matches!(
            state.push(instance),
            Err(ConfigError::DuplicateName { .. })
        ));
        assert_eq!(state.len(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "network.main declared twice")]
    fn test_collect_refuses_duplicates() {
        let instance = DesiredInstance {
            id: InstanceId::new("network", "main"),
            attributes: Attributes::new(),
            depends_on: vec![],
            create_before_destroy: None,
        };
        let _: DesiredState = vec![instance.clone(), instance].into_iter().collect();
    }
}
