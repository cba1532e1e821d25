//! Index engine
//!
//! Per property path a container can hold a basic index (hash-keyed,
//! equality) and an extended index (ordered, range lookups). Requesting an
//! extended index also creates the basic one for the same path.
//!
//! Indices only cover the entry kinds they were created for; an
//! [`IndexResult`] reports that set so the caller can scan entries of other
//! kinds. Resolution never changes query results: callers re-apply the full
//! predicate to every candidate.

use crate::matchmaker::{CompareOp, Matchmaker};
use crate::property::PropertyPath;
use coordspace_common::{EntryId, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use tracing::debug;

/// Index flavour
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    /// Equality lookups
    Basic,
    /// Equality plus ordered lookups
    Extended,
}

/// Entry kinds covered by an index
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexedKinds {
    All,
    Only(BTreeSet<String>),
}

impl IndexedKinds {
    #[must_use]
    pub fn only<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(kinds.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn covers(&self, kind: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(kinds) => kinds.contains(kind),
        }
    }

    fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Only(a), Self::Only(b)) => Self::Only(a.union(b).cloned().collect()),
            _ => Self::All,
        }
    }

    fn intersection(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::All, x) | (x, Self::All) => x.clone(),
            (Self::Only(a), Self::Only(b)) => Self::Only(a.intersection(b).cloned().collect()),
        }
    }
}

/// Definition of an index, as given at container creation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub path: PropertyPath,
    pub index_type: IndexType,
    pub kinds: IndexedKinds,
}

impl IndexSpec {
    pub fn basic(path: impl Into<PropertyPath>, kinds: IndexedKinds) -> Self {
        Self {
            path: path.into(),
            index_type: IndexType::Basic,
            kinds,
        }
    }

    pub fn extended(path: impl Into<PropertyPath>, kinds: IndexedKinds) -> Self {
        Self {
            path: path.into(),
            index_type: IndexType::Extended,
            kinds,
        }
    }
}

/// Candidate set produced by an index lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexResult {
    /// Indexed entries matching the lookup, oldest first
    pub entries: BTreeSet<EntryId>,
    /// Kinds the lookup is complete for
    pub indexed_kinds: IndexedKinds,
}

// Null is never indexed; list properties index their elements.
fn index_keys(value: &Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::List(items) => {
            let unique: BTreeSet<&Value> = items.iter().filter(|v| !v.is_null()).collect();
            unique.into_iter().cloned().collect()
        }
        v => vec![v.clone()],
    }
}

/// Hash-keyed equality index
#[derive(Debug)]
pub struct BasicIndex {
    kinds: IndexedKinds,
    by_value: HashMap<Value, BTreeSet<EntryId>>,
    by_entry: HashMap<EntryId, Vec<Value>>,
}

impl BasicIndex {
    #[must_use]
    pub fn new(kinds: IndexedKinds) -> Self {
        Self {
            kinds,
            by_value: HashMap::new(),
            by_entry: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn kinds(&self) -> &IndexedKinds {
        &self.kinds
    }

    /// Index an entry's property value; replaces any previous value
    pub fn insert(&mut self, id: EntryId, kind: &str, value: &Value) {
        self.remove(id);
        if !self.kinds.covers(kind) {
            return;
        }
        let keys = index_keys(value);
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.by_value.entry(key.clone()).or_default().insert(id);
        }
        self.by_entry.insert(id, keys);
    }

    pub fn remove(&mut self, id: EntryId) {
        let Some(keys) = self.by_entry.remove(&id) else {
            return;
        };
        for key in keys {
            if let Some(ids) = self.by_value.get_mut(&key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_value.remove(&key);
                }
            }
        }
    }

    #[must_use]
    pub fn lookup_eq(&self, value: &Value) -> BTreeSet<EntryId> {
        self.by_value.get(value).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_entry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_entry.is_empty()
    }
}

/// Ordered index for range lookups
#[derive(Debug)]
pub struct ExtendedIndex {
    kinds: IndexedKinds,
    tree: BTreeMap<Value, BTreeSet<EntryId>>,
    by_entry: HashMap<EntryId, Vec<Value>>,
}

impl ExtendedIndex {
    #[must_use]
    pub fn new(kinds: IndexedKinds) -> Self {
        Self {
            kinds,
            tree: BTreeMap::new(),
            by_entry: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn kinds(&self) -> &IndexedKinds {
        &self.kinds
    }

    pub fn insert(&mut self, id: EntryId, kind: &str, value: &Value) {
        self.remove(id);
        if !self.kinds.covers(kind) {
            return;
        }
        let keys: Vec<Value> = index_keys(value)
            .into_iter()
            .filter(Value::is_orderable)
            .collect();
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.tree.entry(key.clone()).or_default().insert(id);
        }
        self.by_entry.insert(id, keys);
    }

    pub fn remove(&mut self, id: EntryId) {
        let Some(keys) = self.by_entry.remove(&id) else {
            return;
        };
        for key in keys {
            if let Some(ids) = self.tree.get_mut(&key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.tree.remove(&key);
                }
            }
        }
    }

    /// Entries whose key lies in the range and has the same variant as
    /// `variant_of`
    #[must_use]
    pub fn range(
        &self,
        lower: Bound<&Value>,
        upper: Bound<&Value>,
        variant_of: &Value,
    ) -> BTreeSet<EntryId> {
        if let (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) =
            (lower, upper)
        {
            let empty = l > u
                || (l == u
                    && (matches!(lower, Bound::Excluded(_)) || matches!(upper, Bound::Excluded(_))));
            if empty {
                return BTreeSet::new();
            }
        }
        self.tree
            .range::<Value, _>((lower, upper))
            .filter(|(k, _)| k.same_variant(variant_of))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    /// Ordered lookup for a comparison operator
    #[must_use]
    pub fn lookup(&self, op: CompareOp, bound: &Value) -> BTreeSet<EntryId> {
        match op {
            CompareOp::Lt => self.range(Bound::Unbounded, Bound::Excluded(bound), bound),
            CompareOp::Le => self.range(Bound::Unbounded, Bound::Included(bound), bound),
            CompareOp::Gt => self.range(Bound::Excluded(bound), Bound::Unbounded, bound),
            CompareOp::Ge => self.range(Bound::Included(bound), Bound::Unbounded, bound),
            CompareOp::Eq => self.range(Bound::Included(bound), Bound::Included(bound), bound),
            CompareOp::Ne => BTreeSet::new(),
        }
    }
}

/// All indices of one container
#[derive(Debug, Default)]
pub struct IndexManager {
    basic: HashMap<PropertyPath, BasicIndex>,
    extended: HashMap<PropertyPath, ExtendedIndex>,
}

impl IndexManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or widen) an index and backfill it from live entries
    ///
    /// `live` yields `(id, kind, property value)` for every live entry.
    pub fn create<'a, I>(&mut self, spec: &IndexSpec, live: I)
    where
        I: IntoIterator<Item = (EntryId, &'a str, Value)>,
    {
        let basic_kinds = self
            .basic
            .get(&spec.path)
            .map_or_else(|| spec.kinds.clone(), |b| b.kinds.union(&spec.kinds));
        let extended_kinds = match spec.index_type {
            IndexType::Extended => Some(
                self.extended
                    .get(&spec.path)
                    .map_or_else(|| spec.kinds.clone(), |e| e.kinds.union(&spec.kinds)),
            ),
            IndexType::Basic => None,
        };

        let mut basic = BasicIndex::new(basic_kinds);
        let mut extended = extended_kinds.map(ExtendedIndex::new);
        let mut count = 0usize;
        for (id, kind, value) in live {
            basic.insert(id, kind, &value);
            if let Some(ext) = extended.as_mut() {
                ext.insert(id, kind, &value);
            }
            count += 1;
        }
        debug!(
            "Created {:?} index on '{}', backfilled from {} entries",
            spec.index_type, spec.path, count
        );

        self.basic.insert(spec.path.clone(), basic);
        if let Some(ext) = extended {
            self.extended.insert(spec.path.clone(), ext);
        }
    }

    /// Paths with at least a basic index
    pub fn paths(&self) -> impl Iterator<Item = &PropertyPath> {
        self.basic.keys()
    }

    #[must_use]
    pub fn has_extended(&self, path: &PropertyPath) -> bool {
        self.extended.contains_key(path)
    }

    /// Index (or re-index) an entry; `property` supplies values per path
    pub fn insert<F>(&mut self, id: EntryId, kind: &str, mut property: F)
    where
        F: FnMut(&PropertyPath) -> Value,
    {
        for (path, index) in &mut self.basic {
            let value = property(path);
            if let Some(ext) = self.extended.get_mut(path) {
                ext.insert(id, kind, &value);
            }
            index.insert(id, kind, &value);
        }
    }

    pub fn remove(&mut self, id: EntryId) {
        for index in self.basic.values_mut() {
            index.remove(id);
        }
        for index in self.extended.values_mut() {
            index.remove(id);
        }
    }

    /// Resolve a predicate to a candidate set; `None` means "scan"
    #[must_use]
    pub fn resolve(&self, matchmaker: &Matchmaker) -> Option<IndexResult> {
        match matchmaker {
            Matchmaker::Compare { path, op, value } => self.resolve_compare(path, *op, value),
            Matchmaker::Between { path, low, high } => {
                if !low.is_orderable() || !low.same_variant(high) {
                    return None;
                }
                let index = self.extended.get(path)?;
                Some(IndexResult {
                    entries: index.range(Bound::Included(low), Bound::Included(high), low),
                    indexed_kinds: index.kinds.clone(),
                })
            }
            Matchmaker::And(children) => children.iter().find_map(|c| self.resolve(c)),
            Matchmaker::Or(children) => {
                let mut iter = children.iter();
                let mut acc = self.resolve(iter.next()?)?;
                for child in iter {
                    let next = self.resolve(child)?;
                    acc.entries.extend(next.entries);
                    acc.indexed_kinds = acc.indexed_kinds.intersection(&next.indexed_kinds);
                }
                Some(acc)
            }
            Matchmaker::Not(_) => None,
        }
    }

    fn resolve_compare(&self, path: &PropertyPath, op: CompareOp, value: &Value) -> Option<IndexResult> {
        match op {
            CompareOp::Eq => {
                if matches!(value, Value::Null | Value::List(_)) {
                    return None;
                }
                let index = self.basic.get(path)?;
                Some(IndexResult {
                    entries: index.lookup_eq(value),
                    indexed_kinds: index.kinds.clone(),
                })
            }
            CompareOp::Ne => None,
            _ => {
                if !value.is_orderable() {
                    return None;
                }
                let index = self.extended.get(path)?;
                Some(IndexResult {
                    entries: index.lookup(op, value),
                    indexed_kinds: index.kinds.clone(),
                })
            }
        }
    }
}
