//! Resource type and attribute schema definitions.
//!
//! A [`ResourceType`] is registered once at start-up and never changes
//! afterwards. Everything the differ needs to know about an attribute
//! lives on its [`AttributeSchema`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::value::Value;

/// Unique address of a managed instance: `(type, logical name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId {
    /// Resource type name.
    pub resource_type: String,
    /// Logical name from the manifest.
    pub name: String,
}

impl InstanceId {
    /// Creates a new instance address.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for InstanceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((resource_type, name)) if !resource_type.is_empty() && !name.is_empty() => {
                Ok(Self::new(resource_type, name))
            }
            _ => Err(format!("invalid instance address '{s}', expected <type>.<name>")),
        }
    }
}

impl TryFrom<String> for InstanceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.to_string()
    }
}

/// Scalar attribute types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    /// UTF-8 string.
    String,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Boolean.
    Bool,
}

/// Shape of an attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    /// A single scalar.
    Primitive(PrimitiveType),
    /// A list of elements.
    List(Box<AttributeKind>),
    /// An unordered collection of unique elements.
    Set(Box<AttributeKind>),
    /// String keys to scalar values.
    Map(PrimitiveType),
    /// A nested block with its own attributes.
    Block(Vec<AttributeSchema>),
}

impl AttributeKind {
    /// Shorthand for a string attribute.
    #[must_use]
    pub const fn string() -> Self {
        Self::Primitive(PrimitiveType::String)
    }

    /// Shorthand for an integer attribute.
    #[must_use]
    pub const fn int() -> Self {
        Self::Primitive(PrimitiveType::Int)
    }

    /// Shorthand for a boolean attribute.
    #[must_use]
    pub const fn bool() -> Self {
        Self::Primitive(PrimitiveType::Bool)
    }

    /// Shorthand for a list of `element`.
    #[must_use]
    pub fn list(element: Self) -> Self {
        Self::List(Box::new(element))
    }

    /// Shorthand for a set of `element`.
    #[must_use]
    pub fn set(element: Self) -> Self {
        Self::Set(Box::new(element))
    }

    /// Returns the nested attribute schema for `key` when this is a block.
    #[must_use]
    pub fn block_attribute(&self, key: &str) -> Option<&AttributeSchema> {
        match self {
            Self::Block(attributes) => attributes.iter().find(|a| a.name == key),
            _ => None,
        }
    }
}

/// Who provides an attribute's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Must be set in configuration.
    Required,
    /// May be set in configuration.
    Optional,
    /// Set by the provider only.
    Computed,
    /// May be set in configuration, otherwise the provider picks a value.
    OptionalComputed,
}

/// Rules that make two different-looking values compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffSuppress {
    /// Plain structural comparison.
    #[default]
    None,
    /// Strings compare case-insensitively.
    CaseInsensitive,
    /// Strings compare after trimming surrounding whitespace.
    TrimWhitespace,
    /// Changes made after creation are never diffed.
    IgnoreChanges,
}

/// Schema for one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSchema {
    /// Attribute name.
    pub name: String,
    /// Value shape.
    pub kind: AttributeKind,
    /// Required/optional/computed flag.
    pub presence: Presence,
    /// Value used when configuration omits the attribute.
    #[serde(default)]
    pub default: Option<Value>,
    /// A change requires destroying and recreating the object.
    #[serde(default)]
    pub force_new: bool,
    /// Element order matters for list comparison.
    #[serde(default)]
    pub ordered: bool,
    /// Diff suppression rule.
    #[serde(default)]
    pub suppress: DiffSuppress,
}

impl AttributeSchema {
    fn with_presence(name: impl Into<String>, kind: AttributeKind, presence: Presence) -> Self {
        Self {
            name: name.into(),
            kind,
            presence,
            default: None,
            force_new: false,
            ordered: false,
            suppress: DiffSuppress::None,
        }
    }

    /// Creates a required attribute.
    #[must_use]
    pub fn required(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self::with_presence(name, kind, Presence::Required)
    }

    /// Creates an optional attribute.
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self::with_presence(name, kind, Presence::Optional)
    }

    /// Creates a provider-computed attribute.
    #[must_use]
    pub fn computed(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self::with_presence(name, kind, Presence::Computed)
    }

    /// Creates an attribute the user may set or the provider may compute.
    #[must_use]
    pub fn optional_computed(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self::with_presence(name, kind, Presence::OptionalComputed)
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Marks the attribute as forcing replacement on change.
    #[must_use]
    pub const fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Marks list element order as significant.
    #[must_use]
    pub const fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Sets the diff suppression rule.
    #[must_use]
    pub const fn suppress(mut self, rule: DiffSuppress) -> Self {
        self.suppress = rule;
        self
    }

    /// Returns true if the provider may fill this attribute.
    #[must_use]
    pub const fn is_computed(&self) -> bool {
        matches!(self.presence, Presence::Computed | Presence::OptionalComputed)
    }

    /// Returns true if configuration may set this attribute.
    #[must_use]
    pub const fn is_settable(&self) -> bool {
        !matches!(self.presence, Presence::Computed)
    }
}

/// A registered resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    /// Type name used in manifests (`network`, `server`, ...).
    pub name: String,
    /// Attributes in declaration order.
    attributes: Vec<AttributeSchema>,
    /// Replacements create the new object before destroying the old one.
    #[serde(default)]
    pub create_before_destroy: bool,
}

impl ResourceType {
    /// Creates an empty resource type.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            create_before_destroy: false,
        }
    }

    /// Appends an attribute.
    #[must_use]
    pub fn with_attribute(mut self, attribute: AttributeSchema) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Makes replacements of this type create-before-destroy.
    #[must_use]
    pub const fn with_create_before_destroy(mut self) -> Self {
        self.create_before_destroy = true;
        self
    }

    /// Looks up an attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// All attributes in declaration order.
    #[must_use]
    pub fn attributes(&self) -> &[AttributeSchema] {
        &self.attributes
    }

    /// Returns true if any attribute forces replacement.
    #[must_use]
    pub fn has_force_new(&self) -> bool {
        self.attributes.iter().any(|a| a.force_new)
    }
}
