//! Deterministic hashing of values and desired state.
//!
//! Hashes identify the configuration a plan was built from and give set
//! elements their canonical order.

use sha2::{Digest, Sha256};

use super::desired::{DesiredInstance, DesiredState};
use crate::schema::Value;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of the whole desired state.
    ///
    /// Declaration order is part of the hash since it drives tie-breaking.
    #[must_use]
    pub fn hash_desired(&self, desired: &DesiredState) -> String {
        let mut hasher = Sha256::new();
        for instance in desired.iter() {
            hasher.update(self.hash_instance(instance).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Computes the hash of one desired instance.
    #[must_use]
    pub fn hash_instance(&self, instance: &DesiredInstance) -> String {
        let mut hasher = Sha256::new();

        hasher.update(instance.id.to_string().as_bytes());
        hasher.update([0u8]);

        for (name, value) in &instance.attributes {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            feed(&mut hasher, value);
        }

        // Explicit dependencies (sorted for determinism)
        let mut depends_on: Vec<_> = instance.depends_on.iter().map(ToString::to_string).collect();
        depends_on.sort_unstable();
        for dependency in depends_on {
            hasher.update(dependency.as_bytes());
            hasher.update([0u8]);
        }

        match instance.create_before_destroy {
            None => hasher.update([0u8]),
            Some(false) => hasher.update([1u8]),
            Some(true) => hasher.update([2u8]),
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the content hash of a single value.
    #[must_use]
    pub fn hash_value(&self, value: &Value) -> String {
        let mut hasher = Sha256::new();
        feed(&mut hasher, value);
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

/// Feeds a tagged, length-prefixed encoding of `value` into the hasher.
fn feed(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => {
            hasher.update([1u8]);
            hasher.update([u8::from(*b)]);
        }
        Value::Int(i) => {
            hasher.update([2u8]);
            hasher.update(i.to_be_bytes());
        }
        Value::Float(x) => {
            hasher.update([3u8]);
            hasher.update(x.to_bits().to_be_bytes());
        }
        Value::String(s) => {
            hasher.update([4u8]);
            feed_str(hasher, s);
        }
        Value::List(items) | Value::Set(items) => {
            hasher.update([if matches!(value, Value::List(_)) { 5u8 } else { 6u8 }]);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                feed(hasher, item);
            }
        }
        Value::Map(map) | Value::Block(map) => {
            hasher.update([if matches!(value, Value::Map(_)) { 7u8 } else { 8u8 }]);
            hasher.update((map.len() as u64).to_be_bytes());
            for (key, item) in map {
                feed_str(hasher, key);
                feed(hasher, item);
            }
        }
        Value::Reference(reference) => {
            hasher.update([9u8]);
            feed_str(hasher, &reference.to_string());
        }
        Value::Unknown => hasher.update([10u8]),
    }
}

fn feed_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attributes, InstanceId};

    fn instance(name: &str, cidr: &str) -> DesiredInstance {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("cidr"), Value::string(cidr));
        DesiredInstance {
            id: InstanceId::new("network", name),
            attributes,
            depends_on: vec![],
            create_before_destroy: None,
        }
    }

    #[test]
    fn test_instance_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let a = instance("main", "10.0.0.0/16");

        assert_eq!(hasher.hash_instance(&a), hasher.hash_instance(&a.clone()));
    }

    #[test]
    fn test_different_instances_different_hash() {
        let hasher = ConfigHasher::new();
        let a = instance("main", "10.0.0.0/16");
        let b = instance("main", "10.1.0.0/16");

        assert_ne!(hasher.hash_instance(&a), hasher.hash_instance(&b));
    }

    #[test]
    fn test_value_hash_distinguishes_kinds() {
        let hasher = ConfigHasher::new();
        assert_ne!(
            hasher.hash_value(&Value::Int(1)),
            hasher.hash_value(&Value::string("1"))
        );
        assert_ne!(
            hasher.hash_value(&Value::List(vec![])),
            hasher.hash_value(&Value::Set(vec![]))
        );
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = hasher.short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }
}
