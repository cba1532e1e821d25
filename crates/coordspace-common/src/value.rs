//! Dynamic value model for entries
//!
//! Entries stored in a space are a `kind` name plus a [`Value`] tree.
//! `Value` is totally ordered and hashable so it can key both the hash-based
//! and the ordered indices.

use crate::types::{AspectRef, ContainerRef, RequestRef, TransactionRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// `f64` with a total order (`f64::total_cmp`) and bitwise equality
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct OrderedFloat(f64);

impl OrderedFloat {
    #[must_use]
    pub const fn new(value: f64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> f64 {
        self.0
    }
}

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for OrderedFloat {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for OrderedFloat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reference to a space object carried inside a value
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Reference {
    Container(ContainerRef),
    Transaction(TransactionRef),
    Request(RequestRef),
    Aspect(AspectRef),
}

/// Entry payload
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Ref(Reference),
}

impl Value {
    /// Build a map value from `(key, value)` pairs
    pub fn map<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Self>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether the value can be used as a bound in an ordered (range) lookup
    #[must_use]
    pub const fn is_orderable(&self) -> bool {
        matches!(
            self,
            Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_) | Self::Bytes(_)
        )
    }

    /// Whether both values are the same variant
    #[must_use]
    pub fn same_variant(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Walk a property path through nested maps
    ///
    /// An empty path yields the value itself. Any segment that is missing or
    /// addresses a non-map value yields `None`.
    #[must_use]
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Self> {
        let mut current = self;
        for segment in path {
            match current {
                Self::Map(fields) => current = fields.get(segment.as_ref())?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Short variant name, used in log and error messages
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Ref(_) => "reference",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(fields) => {
                f.write_str("{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Self::Ref(r) => write!(f, "{r:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(OrderedFloat(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<Self>> for Value {
    fn from(v: Vec<Self>) -> Self {
        Self::List(v)
    }
}

impl From<Reference> for Value {
    fn from(v: Reference) -> Self {
        Self::Ref(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// An entry: the unit written to, read from and taken out of a container
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    /// Entry kind, used by indices to know which entries they cover
    pub kind: String,
    /// Payload
    pub value: Value,
}

impl Entry {
    pub fn new(kind: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Property lookup on the payload
    #[must_use]
    pub fn property<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        self.value.get_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_float_total_order() {
        let nan = OrderedFloat::new(f64::NAN);
        let one = OrderedFloat::new(1.0);
        assert!(one < nan);
        assert_eq!(nan, nan);
        assert!(OrderedFloat::new(-0.0) < OrderedFloat::new(0.0));
    }

    #[test]
    fn test_value_hashable() {
        let mut set = HashSet::new();
        set.insert(Value::from(1.5));
        set.insert(Value::from(1.5));
        set.insert(Value::from("a"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_get_path() {
        let v = Value::map([
            ("name", Value::from("ticket")),
            ("price", Value::map([("amount", Value::from(12))])),
        ]);
        assert_eq!(v.get_path(&["price", "amount"]), Some(&Value::Int(12)));
        assert_eq!(v.get_path(&["name", "x"]), None);
        assert_eq!(v.get_path(&["missing"]), None);
        assert_eq!(v.get_path::<&str>(&[]), Some(&v));
    }

    #[test]
    fn test_orderable() {
        assert!(Value::from(1).is_orderable());
        assert!(Value::from("x").is_orderable());
        assert!(!Value::Null.is_orderable());
        assert!(!Value::List(vec![]).is_orderable());
        assert!(Value::from(1).same_variant(&Value::from(7)));
        assert!(!Value::from(1).same_variant(&Value::from(1.0)));
    }

    #[test]
    fn test_option_into_value() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::from("x"));
    }
}
