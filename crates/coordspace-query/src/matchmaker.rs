//! Predicates over entry properties
//!
//! A [`Matchmaker`] is a predicate tree; a [`Query`] adds an optional entry
//! kind restriction and a result limit.
//!
//! Matching rules shared by the scan path and the indices:
//! - equality matches when the property equals the operand, or when the
//!   property is a list containing the operand
//! - ordering comparisons only match orderable values of the same variant as
//!   the operand (list properties match when any element does)
//! - a missing property reads as `Null`

use crate::property::PropertyPath;
use coordspace_common::{Entry, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Whether this operator needs an ordered index
    #[must_use]
    pub const fn is_ordering(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }

    const fn accepts(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord.is_eq(),
            Self::Ne => ord.is_ne(),
            Self::Lt => ord.is_lt(),
            Self::Le => ord.is_le(),
            Self::Gt => ord.is_gt(),
            Self::Ge => ord.is_ge(),
        }
    }

    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Predicate tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Matchmaker {
    Compare {
        path: PropertyPath,
        op: CompareOp,
        value: Value,
    },
    /// Inclusive range
    Between {
        path: PropertyPath,
        low: Value,
        high: Value,
    },
    And(Vec<Matchmaker>),
    Or(Vec<Matchmaker>),
    Not(Box<Matchmaker>),
}

impl Matchmaker {
    pub fn compare(path: impl Into<PropertyPath>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(path: impl Into<PropertyPath>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Eq, value)
    }

    pub fn between(
        path: impl Into<PropertyPath>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        Self::Between {
            path: path.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::And(mut children) => {
                children.push(other);
                Self::And(children)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Evaluate against an entry, extracting properties directly
    #[must_use]
    pub fn matches(&self, entry: &Entry) -> bool {
        self.matches_with(&mut |path| path.extract(entry))
    }

    /// Evaluate with a caller-supplied property getter (e.g. a cache)
    pub fn matches_with<F>(&self, property: &mut F) -> bool
    where
        F: FnMut(&PropertyPath) -> Value,
    {
        match self {
            Self::Compare { path, op, value } => compare(&property(path), *op, value),
            Self::Between { path, low, high } => between(&property(path), low, high),
            Self::And(children) => children.iter().all(|c| c.matches_with(property)),
            Self::Or(children) => children.iter().any(|c| c.matches_with(property)),
            Self::Not(inner) => !inner.matches_with(property),
        }
    }
}

fn equals(property: &Value, operand: &Value) -> bool {
    if property == operand {
        return true;
    }
    matches!(property, Value::List(items) if items.contains(operand))
}

fn ordered(property: &Value, op: CompareOp, operand: &Value) -> bool {
    let check = |v: &Value| v.is_orderable() && v.same_variant(operand) && op.accepts(v.cmp(operand));
    if !operand.is_orderable() {
        return false;
    }
    match property {
        Value::List(items) => items.iter().any(check),
        v => check(v),
    }
}

fn compare(property: &Value, op: CompareOp, operand: &Value) -> bool {
    match op {
        CompareOp::Eq => equals(property, operand),
        CompareOp::Ne => !equals(property, operand),
        _ => ordered(property, op, operand),
    }
}

fn between(property: &Value, low: &Value, high: &Value) -> bool {
    if !low.same_variant(high) {
        return false;
    }
    let check = |v: &Value| ordered(v, CompareOp::Ge, low) && ordered(v, CompareOp::Le, high);
    match property {
        Value::List(items) => items.iter().any(check),
        v => check(v),
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, children: &[Matchmaker], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, c) in children.iter().enumerate() {
        if i > 0 {
            write!(f, " {sep} ")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str(")")
}

impl fmt::Display for Matchmaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { path, op, value } => write!(f, "{path} {} {value}", op.symbol()),
            Self::Between { path, low, high } => write!(f, "{path} BETWEEN {low} AND {high}"),
            Self::And(children) => write_joined(f, children, "AND"),
            Self::Or(children) => write_joined(f, children, "OR"),
            Self::Not(inner) => write!(f, "NOT {inner}"),
        }
    }
}

/// A predicate plus an optional kind restriction and result limit
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Predicate; `None` matches every entry
    pub matchmaker: Option<Matchmaker>,
    /// Only entries of this kind
    pub kind: Option<String>,
    /// Maximum number of results; `None` means all
    pub limit: Option<usize>,
}

impl Query {
    /// Match everything
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn new(matchmaker: Matchmaker) -> Self {
        Self {
            matchmaker: Some(matchmaker),
            kind: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Number of results wanted when `available` entries match
    #[must_use]
    pub fn wanted(&self, available: usize) -> usize {
        self.limit.map_or(available, |l| l.min(available))
    }

    /// Whether an entry of `kind` can satisfy this query at all
    #[must_use]
    pub fn accepts_kind(&self, kind: &str) -> bool {
        self.kind.as_deref().is_none_or(|k| k == kind)
    }

    #[must_use]
    pub fn matches(&self, entry: &Entry) -> bool {
        self.accepts_kind(&entry.kind)
            && self.matchmaker.as_ref().is_none_or(|m| m.matches(entry))
    }

    pub fn matches_with<F>(&self, kind: &str, property: &mut F) -> bool
    where
        F: FnMut(&PropertyPath) -> Value,
    {
        self.accepts_kind(kind)
            && self
                .matchmaker
                .as_ref()
                .is_none_or(|m| m.matches_with(property))
    }
}
