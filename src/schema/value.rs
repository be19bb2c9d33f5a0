//! Tagged attribute values.
//!
//! Every attribute that crosses the diff/plan boundary is a [`Value`].
//! Values coming from a manifest are built through [`Value::from_yaml`],
//! which checks them against the attribute's [`AttributeKind`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::types::{AttributeKind, InstanceId, Presence, PrimitiveType};
use crate::config::ConfigHasher;

/// Attribute name to value.
pub type Attributes = BTreeMap<String, Value>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Explicitly empty.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    String(String),
    /// Ordered list.
    List(Vec<Value>),
    /// Canonical set: deduplicated, ordered by content hash.
    Set(Vec<Value>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// Nested block.
    Block(BTreeMap<String, Value>),
    /// Pointer to another instance's attribute, not yet resolved.
    Reference(Reference),
    /// Value that is only known once the provider has applied.
    Unknown,
}

/// A `${type.name.attribute}` pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Producing instance.
    pub target: InstanceId,
    /// Attribute on the producer; may be a dotted path into a map or block.
    pub attribute: String,
}

impl Reference {
    /// Parses a whole-string reference such as `${network.main.id}`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let inner = raw.trim().strip_prefix("${")?.strip_suffix('}')?;
        let mut parts = inner.splitn(3, '.');
        let resource_type = parts.next()?.trim();
        let name = parts.next()?.trim();
        let attribute = parts.next()?.trim();
        if resource_type.is_empty() || name.is_empty() || attribute.is_empty() {
            return None;
        }
        Some(Self {
            target: InstanceId::new(resource_type, name),
            attribute: attribute.to_string(),
        })
    }

    /// Attribute path segments.
    #[must_use]
    pub fn path(&self) -> Vec<&str> {
        self.attribute.split('.').collect()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.target, self.attribute)
    }
}

impl Value {
    /// Builds a canonical set from arbitrary elements.
    #[must_use]
    pub fn set(elements: Vec<Self>) -> Self {
        let hasher = ConfigHasher::new();
        let mut keyed: Vec<(String, Self)> = elements
            .into_iter()
            .map(|v| (hasher.hash_value(&v), v))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);
        Self::Set(keyed.into_iter().map(|(_, v)| v).collect())
    }

    /// Shorthand for a string value.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Converts a manifest value into a typed value for `kind`.
    ///
    /// Whole-string references (`"${network.main.id}"`) are accepted for any
    /// kind; their type is checked once resolved. Scalars are coerced the
    /// way YAML authors expect (`size: 10` for a string attribute).
    ///
    /// # Errors
    ///
    /// Returns a description of the mismatch.
    pub fn from_yaml(raw: &serde_yaml::Value, kind: &AttributeKind) -> Result<Self, String> {
        if let serde_yaml::Value::String(s) = raw {
            if let Some(reference) = Reference::parse(s) {
                return Ok(Self::Reference(reference));
            }
            if s.contains("${") {
                return Err(format!(
                    "'{s}' embeds a reference; references must be the whole value"
                ));
            }
        }
        if raw.is_null() {
            return Ok(Self::Null);
        }

        match kind {
            AttributeKind::Primitive(primitive) => primitive_from_yaml(raw, *primitive),
            AttributeKind::List(element) => {
                let items = sequence(raw)?;
                let values = items
                    .iter()
                    .map(|item| Self::from_yaml(item, element))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::List(values))
            }
            AttributeKind::Set(element) => {
                let items = sequence(raw)?;
                let values = items
                    .iter()
                    .map(|item| Self::from_yaml(item, element))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::set(values))
            }
            AttributeKind::Map(primitive) => {
                let mut map = BTreeMap::new();
                for (key, value) in mapping(raw)? {
                    let element = if let serde_yaml::Value::String(s) = value {
                        match Reference::parse(s) {
                            Some(reference) => Self::Reference(reference),
                            None => primitive_from_yaml(value, *primitive)?,
                        }
                    } else {
                        primitive_from_yaml(value, *primitive)?
                    };
                    map.insert(key, element);
                }
                Ok(Self::Map(map))
            }
            AttributeKind::Block(attributes) => {
                let entries = mapping(raw)?;
                let mut block = BTreeMap::new();
                for (key, value) in &entries {
                    let Some(attribute) = attributes.iter().find(|a| &a.name == key) else {
                        return Err(format!("unknown block attribute '{key}'"));
                    };
                    if !attribute.is_settable() {
                        return Err(format!("block attribute '{key}' is computed"));
                    }
                    let converted = Self::from_yaml(value, &attribute.kind)
                        .map_err(|e| format!("{key}: {e}"))?;
                    block.insert(key.clone(), converted);
                }
                for attribute in attributes {
                    if block.contains_key(&attribute.name) {
                        continue;
                    }
                    if let Some(default) = &attribute.default {
                        block.insert(attribute.name.clone(), default.clone());
                    } else if attribute.presence == Presence::Required {
                        return Err(format!(
                            "missing required block attribute '{}'",
                            attribute.name
                        ));
                    }
                }
                Ok(Self::Block(block))
            }
        }
    }

    /// Returns true if no reference or unknown appears anywhere in the value.
    #[must_use]
    pub fn is_known(&self) -> bool {
        match self {
            Self::Reference(_) | Self::Unknown => false,
            Self::List(items) | Self::Set(items) => items.iter().all(Self::is_known),
            Self::Map(map) | Self::Block(map) => map.values().all(Self::is_known),
            _ => true,
        }
    }

    /// Collects every reference held by the value.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(reference) => out.push(reference),
            Self::List(items) | Self::Set(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) | Self::Block(map) => {
                for value in map.values() {
                    value.collect_references(out);
                }
            }
            _ => {}
        }
    }

    /// Walks into maps and blocks following `path`.
    #[must_use]
    pub fn get_path(&self, path: &[&str]) -> Option<&Self> {
        let Some((head, rest)) = path.split_first() else {
            return Some(self);
        };
        match self {
            Self::Map(map) | Self::Block(map) => map.get(*head)?.get_path(rest),
            _ => None,
        }
    }

    /// Returns the string payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if any.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns true for `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

fn sequence(raw: &serde_yaml::Value) -> Result<&Vec<serde_yaml::Value>, String> {
    raw.as_sequence()
        .ok_or_else(|| format!("expected a list, got {}", yaml_kind(raw)))
}

fn mapping(raw: &serde_yaml::Value) -> Result<Vec<(String, &serde_yaml::Value)>, String> {
    let map = raw
        .as_mapping()
        .ok_or_else(|| format!("expected a mapping, got {}", yaml_kind(raw)))?;
    map.iter()
        .map(|(k, v)| match k {
            serde_yaml::Value::String(s) => Ok((s.clone(), v)),
            other => Err(format!("map keys must be strings, got {}", yaml_kind(other))),
        })
        .collect()
}

fn primitive_from_yaml(raw: &serde_yaml::Value, primitive: PrimitiveType) -> Result<Value, String> {
    use serde_yaml::Value as Yaml;

    match (primitive, raw) {
        (PrimitiveType::String, Yaml::String(s)) => Ok(Value::String(s.clone())),
        (PrimitiveType::String, Yaml::Number(n)) => Ok(Value::String(n.to_string())),
        (PrimitiveType::String, Yaml::Bool(b)) => Ok(Value::String(b.to_string())),
        (PrimitiveType::Int, Yaml::Number(n)) => n
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| format!("expected an integer, got {n}")),
        (PrimitiveType::Int, Yaml::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("expected an integer, got '{s}'")),
        (PrimitiveType::Float, Yaml::Number(n)) => n
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| format!("expected a number, got {n}")),
        (PrimitiveType::Float, Yaml::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| format!("expected a number, got '{s}'")),
        (PrimitiveType::Bool, Yaml::Bool(b)) => Ok(Value::Bool(*b)),
        (PrimitiveType::Bool, Yaml::String(s)) => match s.trim() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("expected a bool, got '{s}'")),
        },
        (expected, other) => Err(format!(
            "expected {}, got {}",
            primitive_name(expected),
            yaml_kind(other)
        )),
    }
}

const fn primitive_name(primitive: PrimitiveType) -> &'static str {
    match primitive {
        PrimitiveType::String => "a string",
        PrimitiveType::Int => "an integer",
        PrimitiveType::Float => "a number",
        PrimitiveType::Bool => "a bool",
    }
}

const fn yaml_kind(raw: &serde_yaml::Value) -> &'static str {
    match raw {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "a bool",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a list",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::List(items) | Self::Set(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) | Self::Block(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key} = {value}")?;
                }
                write!(f, "}}")
            }
            Self::Reference(reference) => write!(f, "{reference}"),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::AttributeSchema;

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).expect("valid yaml")
    }

    #[test]
    fn test_parse_reference() {
        let reference = Reference::parse("${network.main.id}").expect("reference");
        assert_eq!(reference.target, InstanceId::new("network", "main"));
        assert_eq!(reference.attribute, "id");
        assert_eq!(reference.to_string(), "${network.main.id}");

        let nested = Reference::parse("${server.web.tags.env}").expect("reference");
        assert_eq!(nested.path(), vec!["tags", "env"]);

        assert!(Reference::parse("network.main.id").is_none());
        assert!(Reference::parse("${network.main}").is_none());
    }

    #[test]
    fn test_scalar_coercion() {
        let v = Value::from_yaml(&yaml("10"), &AttributeKind::string()).expect("coerce");
        assert_eq!(v, Value::string("10"));

        let v = Value::from_yaml(&yaml("\"42\""), &AttributeKind::int()).expect("coerce");
        assert_eq!(v, Value::Int(42));

        assert!(Value::from_yaml(&yaml("[1]"), &AttributeKind::int()).is_err());
    }

    #[test]
    fn test_reference_accepted_for_any_kind() {
        let v = Value::from_yaml(&yaml("\"${network.main.id}\""), &AttributeKind::int())
            .expect("reference");
        assert!(matches!(v, Value::Reference(_)));
        assert!(!v.is_known());

        let err = Value::from_yaml(&yaml("\"net-${network.main.id}\""), &AttributeKind::string());
        assert!(err.is_err());
    }

    #[test]
    fn test_set_is_canonical() {
        let a = Value::from_yaml(&yaml("[b, a, b]"), &AttributeKind::set(AttributeKind::string()))
            .expect("set");
        let b = Value::from_yaml(&yaml("[a, b]"), &AttributeKind::set(AttributeKind::string()))
            .expect("set");
        assert_eq!(a, b);
        if let Value::Set(items) = a {
            assert_eq!(items.len(), 2);
        } else {
            panic!("expected a set");
        }
    }

    #[test]
    fn test_block_defaults_and_required() {
        let kind = AttributeKind::Block(vec![
            AttributeSchema::required("port", AttributeKind::int()),
            AttributeSchema::optional("protocol", AttributeKind::string())
                .with_default(Value::string("tcp")),
        ]);

        let v = Value::from_yaml(&yaml("{port: 80}"), &kind).expect("block");
        assert_eq!(
            v.get_path(&["protocol"]),
            Some(&Value::string("tcp"))
        );

        assert!(Value::from_yaml(&yaml("{protocol: udp}"), &kind).is_err());
        assert!(Value::from_yaml(&yaml("{port: 80, bogus: 1}"), &kind).is_err());
    }

    #[test]
    fn test_collect_references() {
        let v = Value::from_yaml(
            &yaml("[\"${subnet.a.id}\", \"${subnet.b.id}\"]"),
            &AttributeKind::list(AttributeKind::string()),
        )
        .expect("list");
        let mut refs = Vec::new();
        v.collect_references(&mut refs);
        assert_eq!(refs.len(), 2);
    }
}
