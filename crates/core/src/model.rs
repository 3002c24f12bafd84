//! Declared resources and their attribute values.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Identity of a resource: `type.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    pub type_name: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self { type_name: type_name.into(), name: name.into() }
    }

    /// Like [`ResourceId::new`], but rejects parts that would not survive a
    /// round trip through `type.name`: each must be non-empty ASCII
    /// letters, digits, `_` or `-`.
    pub fn parse_parts(type_name: &str, name: &str) -> Result<Self, String> {
        for (what, part) in [("type", type_name), ("name", name)] {
            if !valid_part(part) {
                return Err(format!("invalid resource {what} '{part}': use letters, digits, '_' and '-'"));
            }
        }
        Ok(Self::new(type_name, name))
    }

    pub fn is_valid(&self) -> bool { valid_part(&self.type_name) && valid_part(&self.name) }
}

fn valid_part(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((t, n)) => Self::parse_parts(t, n).map_err(|e| format!("invalid resource id '{s}': {e}")),
            None => Err(format!("invalid resource id '{s}': expected 'type.name'")),
        }
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self { id.to_string() }
}

/// A pointer at another resource's attribute or computed output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub resource: ResourceId,
    pub field: String,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.field)
    }
}

impl FromStr for Reference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(n), Some(field)) if !field.is_empty() => {
                let resource = ResourceId::parse_parts(t, n).map_err(|e| format!("invalid reference '{s}': {e}"))?;
                Ok(Self { resource, field: field.to_string() })
            }
            _ => Err(format!("invalid reference '{s}': expected 'type.name.field'")),
        }
    }
}

/// Attribute value as declared. References are a distinct variant and are
/// only ever resolved by the planner/executor, never by string interpolation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Ref(Reference),
}

impl Value {
    /// Converts a parsed document value. A map holding exactly one `ref`
    /// string key becomes a [`Value::Ref`].
    pub fn from_json(json: Json) -> Result<Self, String> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect::<Result<_, _>>()?),
            Json::Object(map) => {
                if map.len() == 1 {
                    if let Some(Json::String(target)) = map.get("ref") {
                        return Ok(Value::Ref(target.parse()?));
                    }
                }
                Value::Map(map.into_iter().map(|(k, v)| Ok((k, Value::from_json(v)?))).collect::<Result<_, String>>()?)
            }
        })
    }

    /// Every reference contained in this value, depth first.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Value::Ref(r) => out.push(r),
            Value::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Value::Map(map) => map.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }

    /// Replaces every reference the resolver knows. Returns `Err` with the
    /// references that stayed unknown.
    pub fn resolve<F>(&self, resolver: &F) -> Result<Json, Vec<Reference>>
    where
        F: Fn(&Reference) -> Option<Json>,
    {
        let mut unknown = Vec::new();
        let json = self.resolve_into(resolver, &mut unknown);
        if unknown.is_empty() { Ok(json) } else { Err(unknown) }
    }

    fn resolve_into<F>(&self, resolver: &F, unknown: &mut Vec<Reference>) -> Json
    where
        F: Fn(&Reference) -> Option<Json>,
    {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => Json::Number(n.clone()),
            Value::String(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(items.iter().map(|v| v.resolve_into(resolver, unknown)).collect()),
            Value::Map(map) => Json::Object(map.iter().map(|(k, v)| (k.clone(), v.resolve_into(resolver, unknown))).collect()),
            Value::Ref(r) => match resolver(r) {
                Some(v) => v,
                None => {
                    unknown.push(r.clone());
                    Json::Null
                }
            },
        }
    }

    /// Partially resolves: known references become literals, unknown ones stay.
    pub fn substitute<F>(&self, resolver: &F) -> Value
    where
        F: Fn(&Reference) -> Option<Json>,
    {
        match self {
            Value::Ref(r) => resolver(r).map(Value::literal).unwrap_or_else(|| self.clone()),
            Value::List(items) => Value::List(items.iter().map(|v| v.substitute(resolver)).collect()),
            Value::Map(map) => Value::Map(map.iter().map(|(k, v)| (k.clone(), v.substitute(resolver))).collect()),
            other => other.clone(),
        }
    }

    /// A literal value; documents never produce references through this path.
    pub fn literal(json: Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::literal).collect()),
            Json::Object(map) => Value::Map(map.into_iter().map(|(k, v)| (k, Value::literal(v))).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self { Value::Ref(r) }
}

/// Declared attributes of one resource.
pub type Attributes = BTreeMap<String, Value>;

/// Concrete attribute values as sent to or returned by a provider.
pub type ResolvedAttributes = BTreeMap<String, Json>;

/// A declared resource. Immutable for the duration of one plan cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub id: ResourceId,
    pub attributes: Attributes,
    pub depends_on: Vec<ResourceId>,
    /// Attributes whose change forces delete-then-create.
    pub immutable: BTreeSet<String>,
}

impl ResourceSpec {
    pub fn new(id: ResourceId) -> Self {
        Self { id, attributes: Attributes::new(), depends_on: Vec::new(), immutable: BTreeSet::new() }
    }

    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn depends_on(mut self, id: ResourceId) -> Self {
        self.depends_on.push(id);
        self
    }

    pub fn immutable(mut self, key: &str) -> Self {
        self.immutable.insert(key.to_string());
        self
    }

    pub fn references(&self) -> Vec<&Reference> {
        self.attributes.values().flat_map(Value::references).collect()
    }
}

/// A spec together with its conditional count (0 or 1).
#[derive(Debug, Clone)]
pub struct Declaration {
    pub spec: ResourceSpec,
    pub count: u8,
}

impl Declaration {
    /// Collapses the count into presence, rejecting anything but 0 or 1.
    pub fn resolve(self) -> Result<Option<ResourceSpec>, String> {
        match self.count {
            0 => Ok(None),
            1 => Ok(Some(self.spec)),
            n => Err(format!("{}: count must be 0 or 1, got {n}", self.spec.id)),
        }
    }
}
