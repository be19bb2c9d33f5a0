//! Attribute-level diff between desired configuration and applied state.
//!
//! The [`Differ`] walks a resource type's schema and compares each attribute,
//! recursing into maps and nested blocks. The result classifies the action
//! the instance needs and carries the planned attributes downstream
//! references resolve against.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::config::ConfigHasher;
use crate::schema::{
    AttributeKind, AttributeSchema, Attributes, DiffSuppress, InstanceId, ResourceType, Value,
};
use crate::state::InstanceState;

/// Dotted path to an attribute (`tags.env`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct AttributePath(Vec<String>);

impl AttributePath {
    /// Path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Top-level attribute name.
    #[must_use]
    pub fn root(&self) -> &str {
        self.0.first().map_or("", String::as_str)
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<AttributePath> for String {
    fn from(path: AttributePath) -> Self {
        path.to_string()
    }
}

/// What happens to one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Value set or changed in place.
    Set,
    /// Value removed.
    Unset,
    /// Change requires a new object.
    ForcesReplacement,
}

impl ChangeAction {
    /// Marker used in plan output.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Set => "~",
            Self::Unset => "-",
            Self::ForcesReplacement => "-/+",
        }
    }
}

/// Change to one attribute path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeDiff {
    /// Where the change is.
    pub path: AttributePath,
    /// Applied value, if any.
    pub old: Option<Value>,
    /// Desired value, if any; may be unknown until apply.
    pub new: Option<Value>,
    /// Kind of change.
    pub action: ChangeAction,
}

impl AttributeDiff {
    /// Returns true if the new value is only known after apply.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.new.as_ref().is_some_and(|v| !v.is_known())
    }
}

/// Action an instance needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceAction {
    /// Nothing to do.
    NoOp,
    /// Object does not exist yet.
    Create,
    /// In-place update.
    Update,
    /// Update whose final shape depends on values known after apply.
    UpdatePending,
    /// Object must be replaced.
    DestroyCreate,
    /// Object is no longer declared.
    Destroy,
}

impl fmt::Display for InstanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoOp => "no-op",
            Self::Create => "create",
            Self::Update => "update",
            Self::UpdatePending => "update (pending)",
            Self::DestroyCreate => "replace",
            Self::Destroy => "destroy",
        };
        write!(f, "{s}")
    }
}

/// Diff for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceDiff {
    /// Instance address.
    pub instance: InstanceId,
    /// Classified action.
    pub action: InstanceAction,
    /// Attribute changes in schema order.
    pub attributes: Vec<AttributeDiff>,
    /// Attributes the instance will have after apply.
    pub planned: Attributes,
}

impl InstanceDiff {
    /// Returns true if the instance must be destroyed and recreated.
    #[must_use]
    pub fn requires_replacement(&self) -> bool {
        self.action == InstanceAction::DestroyCreate
    }

    /// Returns true if anything needs doing.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.action != InstanceAction::NoOp
    }

    /// Attributes whose change forces replacement.
    #[must_use]
    pub fn replacement_paths(&self) -> Vec<&AttributePath> {
        self.attributes
            .iter()
            .filter(|a| a.action == ChangeAction::ForcesReplacement)
            .map(|a| &a.path)
            .collect()
    }

    /// Applies the attribute changes to `current`.
    #[must_use]
    pub fn apply_to(&self, current: &Attributes) -> Attributes {
        let mut result = current.clone();
        for change in &self.attributes {
            let segments = change.path.segments();
            match &change.new {
                Some(value) => set_path(&mut result, segments, value.clone()),
                None => remove_path(&mut result, segments),
            }
        }
        result
    }
}

fn set_path(attributes: &mut Attributes, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        attributes.insert(head.clone(), value);
        return;
    }
    let entry = attributes
        .entry(head.clone())
        .or_insert_with(|| Value::Map(Attributes::new()));
    match entry {
        Value::Map(map) | Value::Block(map) => set_path(map, rest, value),
        other => {
            let mut map = Attributes::new();
            set_path(&mut map, rest, value);
            *other = Value::Map(map);
        }
    }
}

fn remove_path(attributes: &mut Attributes, segments: &[String]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        attributes.remove(head);
        return;
    }
    if let Some(Value::Map(map) | Value::Block(map)) = attributes.get_mut(head) {
        remove_path(map, rest);
    }
}

/// Compares desired attributes with applied state.
#[derive(Debug, Default)]
pub struct Differ {
    hasher: ConfigHasher,
}

/// Comparison rules for one level of the attribute tree.
#[derive(Clone, Copy)]
struct Rules<'a> {
    kind: &'a AttributeKind,
    force_new: bool,
    ordered: bool,
    suppress: DiffSuppress,
}

impl<'a> Rules<'a> {
    const fn of(attribute: &'a AttributeSchema) -> Self {
        Self {
            kind: &attribute.kind,
            force_new: attribute.force_new,
            ordered: attribute.ordered,
            suppress: attribute.suppress,
        }
    }

    fn nested(self, key: &str) -> Option<Self> {
        match self.kind {
            AttributeKind::Block(_) => self.kind.block_attribute(key).map(|attr| Self {
                force_new: self.force_new || attr.force_new,
                ..Self::of(attr)
            }),
            AttributeKind::Map(_) => Some(self),
            _ => None,
        }
    }
}

impl Differ {
    /// Creates a new differ.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Diffs one instance.
    ///
    /// `desired` is `None` when the instance is no longer declared and
    /// `current` is `None` when it has never been created.
    #[must_use]
    pub fn diff(
        &self,
        schema: &ResourceType,
        instance: &InstanceId,
        desired: Option<&Attributes>,
        current: Option<&InstanceState>,
        tainted: bool,
    ) -> InstanceDiff {
        let Some(desired) = desired else {
            let action = if current.is_some() {
                InstanceAction::Destroy
            } else {
                InstanceAction::NoOp
            };
            return InstanceDiff {
                instance: instance.clone(),
                action,
                attributes: Vec::new(),
                planned: Attributes::new(),
            };
        };

        let empty = Attributes::new();
        let applied = current.map_or(&empty, |c| &c.attributes);
        let mut changes = Vec::new();
        let mut planned = Attributes::new();

        for attribute in schema.attributes() {
            let name = &attribute.name;
            let want = present(desired.get(name));
            let have = present(applied.get(name));

            if want.is_none() && attribute.is_computed() {
                if let Some(have) = have {
                    planned.insert(name.clone(), have.clone());
                }
                continue;
            }
            if attribute.suppress == DiffSuppress::IgnoreChanges
                && current.is_some()
                && let Some(have) = have
            {
                planned.insert(name.clone(), have.clone());
                continue;
            }

            let before = changes.len();
            let mut path = vec![name.clone()];
            self.compare(&mut path, Rules::of(attribute), have, want, &mut changes);

            let value = if changes.len() > before { want } else { have.or(want) };
            if let Some(value) = value {
                planned.insert(name.clone(), value.clone());
            }
        }

        let action = if current.is_none() {
            InstanceAction::Create
        } else if tainted
            || changes
                .iter()
                .any(|c| c.action == ChangeAction::ForcesReplacement && !c.is_unknown())
        {
            InstanceAction::DestroyCreate
        } else if changes.iter().any(AttributeDiff::is_unknown) {
            InstanceAction::UpdatePending
        } else if !changes.is_empty() {
            InstanceAction::Update
        } else {
            InstanceAction::NoOp
        };

        if matches!(action, InstanceAction::Create | InstanceAction::DestroyCreate) {
            // A new object: provider-computed values are not known yet.
            for attribute in schema.attributes() {
                if attribute.is_computed() && present(desired.get(&attribute.name)).is_none() {
                    planned.insert(attribute.name.clone(), Value::Unknown);
                }
            }
        }

        InstanceDiff {
            instance: instance.clone(),
            action,
            attributes: changes,
            planned,
        }
    }

    fn compare(
        &self,
        path: &mut Vec<String>,
        rules: Rules<'_>,
        old: Option<&Value>,
        new: Option<&Value>,
        out: &mut Vec<AttributeDiff>,
    ) {
        match (old, new) {
            (None, None) => {}
            (Some(Value::Map(before) | Value::Block(before)), Some(Value::Map(after) | Value::Block(after)))
                if matches!(rules.kind, AttributeKind::Map(_) | AttributeKind::Block(_)) =>
            {
                let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
                for key in keys {
                    let Some(nested) = rules.nested(key) else {
                        continue;
                    };
                    path.push(key.clone());
                    self.compare(
                        path,
                        nested,
                        present(before.get(key)),
                        present(after.get(key)),
                        out,
                    );
                    path.pop();
                }
            }
            (Some(before), Some(after)) if after.is_known() && self.equal(rules, before, after) => {}
            _ => out.push(AttributeDiff {
                path: AttributePath(path.clone()),
                old: old.cloned(),
                new: new.cloned(),
                action: if rules.force_new {
                    ChangeAction::ForcesReplacement
                } else if new.is_none() {
                    ChangeAction::Unset
                } else {
                    ChangeAction::Set
                },
            }),
        }
    }

    fn equal(&self, rules: Rules<'_>, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::List(x), Value::List(y)) if rules.ordered => {
                x.len() == y.len() && x.iter().zip(y).all(|(p, q)| self.equal(rules, p, q))
            }
            (Value::List(x) | Value::Set(x), Value::List(y) | Value::Set(y)) => {
                x.len() == y.len() && self.multiset(rules, x) == self.multiset(rules, y)
            }
            (Value::Map(x) | Value::Block(x), Value::Map(y) | Value::Block(y)) => {
                x.len() == y.len()
                    && x.iter()
                        .all(|(k, v)| y.get(k).is_some_and(|w| self.equal(rules, v, w)))
            }
            _ => scalar_equal(rules.suppress, a, b),
        }
    }

    fn multiset(&self, rules: Rules<'_>, items: &[Value]) -> Vec<String> {
        let mut hashes: Vec<String> = items
            .iter()
            .map(|item| self.hasher.hash_value(&normalize(rules.suppress, item)))
            .collect();
        hashes.sort();
        hashes
    }
}

/// Treats an explicit null the same as an absent value.
fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

#[allow(clippy::float_cmp)]
fn scalar_equal(suppress: DiffSuppress, a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => {
            int_as_float(*i) == *f
        }
        (Value::String(_), Value::String(_)) => normalize(suppress, a) == normalize(suppress, b),
        _ => a == b,
    }
}

#[allow(clippy::cast_precision_loss)]
const fn int_as_float(i: i64) -> f64 {
    i as f64
}

fn normalize(suppress: DiffSuppress, value: &Value) -> Value {
    match (suppress, value) {
        (DiffSuppress::CaseInsensitive, Value::String(s)) => Value::String(s.to_lowercase()),
        (DiffSuppress::TrimWhitespace, Value::String(s)) => Value::String(s.trim().to_string()),
        (_, Value::Int(i)) => Value::Float(int_as_float(*i)),
        _ => value.clone(),
    }
}
