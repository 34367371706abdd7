//! Dynamic tree values.
//!
//! [`Value`] is the currency of the store: initial trees are built from it,
//! reads hand it back, and writes accept it. Two variants carry store
//! semantics rather than data:
//!
//! - [`Value::Opaque`] — a shallow-marked payload. The store keeps it as a
//!   raw shared reference instead of recursing into it; interior mutation is
//!   invisible to the dependency graph.
//! - [`Value::Computed`] — a derivation declared in the tree. The store
//!   turns it into a lazily-cached computed property instead of storing it.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use super::error::DerivationError;
use super::node::Node;

/// A computed-property definition: a pure function of the declaring node and
/// the store root, captured once at declaration.
pub type ComputedFn = Arc<dyn Fn(&Node, &Node) -> Result<Value, DerivationError> + Send + Sync>;

/// A dynamic tree value.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    /// Shallow-marked payload, stored and returned as an opaque reference.
    Opaque(Opaque),
    /// A derivation declared in the tree.
    Computed(ComputedFn),
}

/// Tag a value so the store treats it as opaque wherever it is embedded:
/// stored as a raw reference, never recursed into, interior changes
/// unobserved.
pub fn shallow(value: Value) -> Value {
    Value::Opaque(Opaque::new(value))
}

impl Value {
    /// Declare a computed property.
    pub fn computed<F>(f: F) -> Value
    where
        F: Fn(&Node, &Node) -> Result<Value, DerivationError> + Send + Sync + 'static,
    {
        Value::Computed(Arc::new(f))
    }

    /// Build an object value from key/value pairs, preserving order.
    pub fn object<K, I>(entries: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// Build an array value.
    pub fn array<I>(items: I) -> Value
    where
        I: IntoIterator<Item = Value>,
    {
        Value::Array(items.into_iter().collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Value::Opaque(o) => Some(o),
            _ => None,
        }
    }

    /// Variant name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Opaque(_) => "opaque",
            Value::Computed(_) => "computed",
        }
    }

    /// Convert to a `serde_json` value. Opaque payloads convert as their
    /// interior; computed definitions have no structural representation and
    /// become `null` (snapshots never contain them).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Opaque(o) => o.get().to_json(),
            Value::Computed(_) => serde_json::Value::Null,
        }
    }
}

/// Identity equality for opaque and computed variants, structural equality
/// for data.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a.ptr_eq(b),
            (Value::Computed(a), Value::Computed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::Object(map) => f.debug_tuple("Object").field(map).finish(),
            Value::Opaque(o) => f.debug_tuple("Opaque").field(&o.get()).finish(),
            Value::Computed(_) => write!(f, "Computed(..)"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
            Value::Opaque(o) => o.get().serialize(serializer),
            Value::Computed(_) => serializer.serialize_unit(),
        }
    }
}

/// Shared handle behind a shallow-marked value.
///
/// Clones share one interior; [`get`](Opaque::get)/[`set`](Opaque::set)/
/// [`modify`](Opaque::modify) act on it directly, with no dependency-graph
/// involvement. Only replacing the whole reference in its parent slot is
/// observable.
#[derive(Clone)]
pub struct Opaque {
    inner: Arc<RwLock<Value>>,
}

impl Opaque {
    pub fn new(value: Value) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Clone of the interior value.
    pub fn get(&self) -> Value {
        self.inner.read().clone()
    }

    /// Replace the interior value. Unobserved.
    pub fn set(&self, value: Value) {
        *self.inner.write() = value;
    }

    /// Mutate the interior value in place. Unobserved.
    pub fn modify(&self, f: impl FnOnce(&mut Value)) {
        f(&mut self.inner.write());
    }

    /// Identity comparison: do both handles share one interior?
    pub fn ptr_eq(&self, other: &Opaque) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
