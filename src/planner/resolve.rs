//! Reference resolution.
//!
//! References are resolved against the outputs of upstream instances:
//! planned attributes while planning, committed state while applying.
//! A reference whose value is not known yet becomes [`Value::Unknown`].

use std::collections::HashMap;

use crate::schema::{Attributes, InstanceId, Reference, Value};
use crate::state::StateSnapshot;

/// What downstream instances can see of an upstream instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    /// Provider identifier, `None` while it is still to be created.
    pub id: Option<String>,
    /// Known or planned attributes.
    pub attributes: Attributes,
}

/// Outputs keyed by instance.
pub type Outputs = HashMap<InstanceId, Output>;

/// Resolved attributes plus the references that stayed unknown.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Attributes with every resolvable reference substituted.
    pub attributes: Attributes,
    /// References that resolved to an unknown value.
    pub unresolved: Vec<Reference>,
}

impl Resolution {
    /// Returns true if every reference resolved to a known value.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Builds outputs from the committed state.
#[must_use]
pub fn outputs_from_state(snapshot: &StateSnapshot) -> Outputs {
    snapshot
        .instances
        .iter()
        .map(|(id, state)| {
            (
                id.clone(),
                Output {
                    id: Some(state.id.clone()),
                    attributes: state.attributes.clone(),
                },
            )
        })
        .collect()
}

/// Substitutes references in `attributes`.
#[must_use]
pub fn resolve(attributes: &Attributes, outputs: &Outputs) -> Resolution {
    let mut unresolved = Vec::new();
    let attributes = attributes
        .iter()
        .map(|(name, value)| (name.clone(), resolve_value(value, outputs, &mut unresolved)))
        .collect();
    Resolution {
        attributes,
        unresolved,
    }
}

fn resolve_value(value: &Value, outputs: &Outputs, unresolved: &mut Vec<Reference>) -> Value {
    match value {
        Value::Reference(reference) => match lookup(reference, outputs) {
            Some(found) if found.is_known() => found,
            _ => {
                unresolved.push(reference.clone());
                Value::Unknown
            }
        },
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|item| resolve_value(item, outputs, unresolved))
                .collect(),
        ),
        Value::Set(items) => {
            let resolved: Vec<Value> = items
                .iter()
                .map(|item| resolve_value(item, outputs, unresolved))
                .collect();
            // Resolved elements may hash differently than the references did.
            Value::set(resolved)
        }
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, outputs, unresolved)))
                .collect(),
        ),
        Value::Block(map) => Value::Block(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, outputs, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup(reference: &Reference, outputs: &Outputs) -> Option<Value> {
    let output = outputs.get(&reference.target)?;
    let path = reference.path();
    let (head, rest) = path.split_first()?;
    if *head == "id" && rest.is_empty() {
        return output.id.clone().map(Value::String);
    }
    output.attributes.get(*head)?.get_path(rest).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn reference(raw: &str) -> Value {
        Value::Reference(Reference::parse(raw).expect("reference"))
    }

    fn outputs() -> Outputs {
        let mut tags = BTreeMap::new();
        tags.insert(String::from("env"), Value::string("dev"));
        let mut attributes = Attributes::new();
        attributes.insert(String::from("cidr"), Value::string("10.0.0.0/16"));
        attributes.insert(String::from("tags"), Value::Map(tags));
        attributes.insert(String::from("arn"), Value::Unknown);

        let mut outputs = Outputs::new();
        outputs.insert(
            InstanceId::new("network", "main"),
            Output {
                id: Some(String::from("net-1")),
                attributes,
            },
        );
        outputs.insert(
            InstanceId::new("network", "new"),
            Output {
                id: None,
                attributes: Attributes::new(),
            },
        );
        outputs
    }

    #[test]
    fn test_resolves_id_and_nested_paths() {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("network_id"), reference("${network.main.id}"));
        attributes.insert(String::from("env"), reference("${network.main.tags.env}"));

        let resolution = resolve(&attributes, &outputs());
        assert!(resolution.is_complete());
        assert_eq!(resolution.attributes["network_id"], Value::string("net-1"));
        assert_eq!(resolution.attributes["env"], Value::string("dev"));
    }

    #[test]
    fn test_unknown_outputs_stay_unknown() {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("a"), reference("${network.new.id}"));
        attributes.insert(String::from("b"), reference("${network.main.arn}"));
        attributes.insert(
            String::from("c"),
            Value::List(vec![reference("${network.main.cidr}")]),
        );

        let resolution = resolve(&attributes, &outputs());
        assert_eq!(resolution.unresolved.len(), 2);
        assert_eq!(resolution.attributes["a"], Value::Unknown);
        assert_eq!(resolution.attributes["b"], Value::Unknown);
        assert_eq!(
            resolution.attributes["c"],
            Value::List(vec![Value::string("10.0.0.0/16")])
        );
    }
}
