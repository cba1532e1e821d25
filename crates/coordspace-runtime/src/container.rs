//! Containers
//!
//! A container keeps every live entry id in id order together with the
//! entry's kind and lock state. Uncommitted writes and pending takes lock
//! their entry for every other transaction. Indices and the property value
//! cache are maintained here, in the same critical section as the slot map.
//!
//! Transient containers hold their entries in memory. Persistent containers
//! forward every change to their stored map under the writing transaction
//! and keep only uncommitted writes resident; committed entries are loaded
//! back through the stored map's value cache when a query or a copy needs
//! them.

use coordspace_common::{ContainerRef, Entry, EntryId, TxId, Value};
use coordspace_persistence::{EntryKeyFactory, PersistenceError, PersistenceResult, StoredMap};
use coordspace_query::{
    IndexManager, IndexSpec, IndexedKinds, PropertyPath, PropertyValueCache, Query,
};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Table backing a persistent container
#[must_use]
pub fn table_name(container: &str) -> String {
    format!("entries:{container}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockState {
    Committed,
    /// Written by a transaction that has not committed yet
    Written(TxId),
    /// Committed, with a take pending in a transaction
    Taken(TxId),
}

#[derive(Debug)]
struct Slot {
    kind: String,
    /// `None` once a persistent entry is committed to the stored map
    resident: Option<Entry>,
    lock: LockState,
}

impl Slot {
    fn stored(kind: String) -> Self {
        Self {
            kind,
            resident: None,
            lock: LockState::Committed,
        }
    }
}

/// Result of matching a query against a container
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Selection {
    /// Visible matches, oldest first
    pub matches: Vec<EntryId>,
    /// Transactions holding locks on matching entries
    pub holders: BTreeSet<TxId>,
}

/// How a take changed an entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TakeEffect {
    /// Committed entry, removed when the transaction commits
    Pending,
    /// The transaction's own uncommitted write, removed immediately
    Discarded,
}

pub struct Container {
    reference: ContainerRef,
    slots: BTreeMap<EntryId, Slot>,
    indexes: IndexManager,
    specs: Vec<IndexSpec>,
    properties: PropertyValueCache,
    store: Option<StoredMap<EntryId, Entry>>,
    keys: EntryKeyFactory,
}

impl Container {
    /// Create a container; a stored map brings back its committed entries
    pub fn open(
        reference: ContainerRef,
        properties: PropertyValueCache,
        store: Option<StoredMap<EntryId, Entry>>,
        indexes: &[IndexSpec],
    ) -> PersistenceResult<Self> {
        let recovered = match &store {
            Some(store) => store.load_all()?,
            None => Vec::new(),
        };
        let keys = EntryKeyFactory::seeded(recovered.iter().map(|(id, _)| *id));
        if !recovered.is_empty() {
            info!(
                "Recovered {} entries into container '{}'",
                recovered.len(),
                reference.id()
            );
        }

        let mut container = Self {
            reference,
            slots: BTreeMap::new(),
            indexes: IndexManager::new(),
            specs: Vec::new(),
            properties,
            store,
            keys,
        };
        for spec in indexes {
            let live = recovered.iter().map(|(id, entry)| {
                let value = container
                    .properties
                    .get_or_compute(*id, &spec.path, || spec.path.extract(entry));
                (*id, entry.kind.as_str(), value)
            });
            container.indexes.create(spec, live);
            container.specs.push(spec.clone());
        }
        container.slots = recovered
            .into_iter()
            .map(|(id, entry)| (id, Slot::stored(entry.kind)))
            .collect();
        Ok(container)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.reference.id()
    }

    #[must_use]
    pub const fn reference(&self) -> &ContainerRef {
        &self.reference
    }

    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    #[must_use]
    pub fn index_specs(&self) -> &[IndexSpec] {
        &self.specs
    }

    /// Add an index and backfill it from every live entry
    pub fn create_index(&mut self, spec: IndexSpec) -> PersistenceResult<()> {
        let mut live = Vec::with_capacity(self.slots.len());
        for (id, slot) in &self.slots {
            live.push((*id, slot.kind.as_str(), self.property(*id, slot, &spec.path)?));
        }
        self.indexes.create(&spec, live);
        self.specs.push(spec);
        Ok(())
    }

    /// Live entries, including locked ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Entries currently held in memory
    #[must_use]
    pub fn resident(&self) -> usize {
        self.slots.values().filter(|s| s.resident.is_some()).count()
    }

    /// The entry with this id, loaded from the stored map when it is not
    /// resident
    pub fn entry(&self, id: EntryId) -> PersistenceResult<Option<Cow<'_, Entry>>> {
        match self.slots.get(&id) {
            Some(slot) => self.load(id, slot).map(Some),
            None => Ok(None),
        }
    }

    fn load<'a>(&'a self, id: EntryId, slot: &'a Slot) -> PersistenceResult<Cow<'a, Entry>> {
        if let Some(entry) = &slot.resident {
            return Ok(Cow::Borrowed(entry));
        }
        let missing = |table: &str| PersistenceError::MissingValue {
            table: table.to_string(),
            key: id.to_string(),
        };
        let store = self.store.as_ref().ok_or_else(|| missing(self.name()))?;
        store
            .get(&id)?
            .map(Cow::Owned)
            .ok_or_else(|| missing(store.adapter().table()))
    }

    /// Property value through the property cache
    fn property(&self, id: EntryId, slot: &Slot, path: &PropertyPath) -> PersistenceResult<Value> {
        let mut failure = None;
        let value = self.properties.get_or_compute(id, path, || match self.load(id, slot) {
            Ok(entry) => path.extract(&entry),
            Err(e) => {
                failure = Some(e);
                Value::Null
            }
        });
        match failure {
            Some(e) => {
                // the placeholder must not stay cached
                self.properties.purge(id);
                Err(e)
            }
            None => Ok(value),
        }
    }

    fn matches(&self, id: EntryId, slot: &Slot, query: &Query) -> PersistenceResult<bool> {
        let mut failure = None;
        let mut property = |path: &PropertyPath| match self.property(id, slot, path) {
            Ok(value) => value,
            Err(e) => {
                failure.get_or_insert(e);
                Value::Null
            }
        };
        let matched = query.matches_with(&slot.kind, &mut property);
        failure.map_or(Ok(matched), Err)
    }

    /// Match a query as seen by `tx`
    pub fn select(&self, query: &Query, tx: TxId) -> PersistenceResult<Selection> {
        let mut selection = Selection::default();
        let limit = query.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(selection);
        }

        for id in self.candidates(query) {
            let Some(slot) = self.slots.get(&id) else {
                continue;
            };
            let holder = match slot.lock {
                LockState::Committed => None,
                LockState::Written(owner) if owner == tx => None,
                LockState::Taken(owner) if owner == tx => continue,
                LockState::Written(owner) | LockState::Taken(owner) => Some(owner),
            };
            if !self.matches(id, slot, query)? {
                continue;
            }

            match holder {
                None => {
                    selection.matches.push(id);
                    if selection.matches.len() >= limit {
                        break;
                    }
                }
                Some(owner) => {
                    selection.holders.insert(owner);
                }
            }
        }
        Ok(selection)
    }

    /// Entry ids worth testing against a query, in id order
    fn candidates(&self, query: &Query) -> Vec<EntryId> {
        let Some(result) = query
            .matchmaker
            .as_ref()
            .and_then(|m| self.indexes.resolve(m))
        else {
            return self.slots.keys().copied().collect();
        };

        let mut ids = result.entries;
        if !matches!(result.indexed_kinds, IndexedKinds::All) {
            ids.extend(
                self.slots
                    .iter()
                    .filter(|(_, slot)| {
                        query.accepts_kind(&slot.kind) && !result.indexed_kinds.covers(&slot.kind)
                    })
                    .map(|(id, _)| *id),
            );
        }
        ids.into_iter().collect()
    }

    /// Add an entry written (not yet committed) by `tx`
    pub fn insert(&mut self, entry: Entry, tx: TxId) -> PersistenceResult<EntryId> {
        let id = self.keys.next_key();
        if let Some(store) = self.store.as_mut() {
            store.put(id, &entry, Some(tx))?;
        }
        self.indexes.insert(id, &entry.kind, |path| {
            self.properties
                .get_or_compute(id, path, || path.extract(&entry))
        });
        self.slots.insert(
            id,
            Slot {
                kind: entry.kind.clone(),
                resident: Some(entry),
                lock: LockState::Written(tx),
            },
        );
        Ok(id)
    }

    /// Take an entry visible to `tx`; `None` when it is not takeable
    pub fn take(&mut self, id: EntryId, tx: TxId) -> PersistenceResult<Option<TakeEffect>> {
        let Some(lock) = self.lock_of(id) else {
            return Ok(None);
        };
        let effect = match lock {
            LockState::Committed => TakeEffect::Pending,
            LockState::Written(owner) if owner == tx => TakeEffect::Discarded,
            _ => return Ok(None),
        };

        if let Some(store) = &self.store {
            store.remove(&id, Some(tx))?;
        }
        match effect {
            TakeEffect::Pending => {
                if let Some(slot) = self.slots.get_mut(&id) {
                    slot.lock = LockState::Taken(tx);
                }
            }
            TakeEffect::Discarded => self.discard(id),
        }
        Ok(Some(effect))
    }

    /// Publish a write; persistent entries leave memory once durable
    pub fn commit_write(&mut self, id: EntryId, tx: TxId) {
        let persistent = self.is_persistent();
        if let Some(slot) = self.slots.get_mut(&id)
            && slot.lock == LockState::Written(tx)
        {
            slot.lock = LockState::Committed;
            if persistent {
                slot.resident = None;
            }
        }
    }

    pub fn commit_take(&mut self, id: EntryId, tx: TxId) {
        if self.lock_of(id) == Some(LockState::Taken(tx)) {
            self.discard(id);
        }
    }

    pub fn rollback_write(&mut self, id: EntryId, tx: TxId) {
        if self.lock_of(id) == Some(LockState::Written(tx)) {
            self.discard(id);
            if let Some(store) = &self.store {
                store.rollback_key(&id);
            }
        }
    }

    pub fn rollback_take(&mut self, id: EntryId, tx: TxId) {
        if let Some(slot) = self.slots.get_mut(&id)
            && slot.lock == LockState::Taken(tx)
        {
            slot.lock = LockState::Committed;
        }
    }

    fn lock_of(&self, id: EntryId) -> Option<LockState> {
        self.slots.get(&id).map(|s| s.lock)
    }

    fn discard(&mut self, id: EntryId) {
        self.slots.remove(&id);
        self.indexes.remove(id);
        self.properties.purge(id);
    }

    /// Remove every entry
    ///
    /// Fails with a lock conflict while any transaction holds a lock here.
    pub fn clear(&mut self) -> PersistenceResult<usize> {
        let owners: BTreeSet<TxId> = self
            .slots
            .values()
            .filter_map(|s| match s.lock {
                LockState::Committed => None,
                LockState::Written(tx) | LockState::Taken(tx) => Some(tx),
            })
            .collect();
        if !owners.is_empty() {
            return Err(PersistenceError::LockConflict {
                table: self.name().to_string(),
                transactions: owners.len(),
            });
        }
        if let Some(store) = &self.store {
            store.clear()?;
        }

        let ids: Vec<EntryId> = self.slots.keys().copied().collect();
        for id in &ids {
            self.discard(*id);
        }
        debug!("Cleared {} entries from container '{}'", ids.len(), self.name());
        Ok(ids.len())
    }

    /// Drop the container's durable state
    pub fn destroy(self) -> PersistenceResult<()> {
        match &self.store {
            Some(store) => store.destroy(),
            None => Ok(()),
        }
    }

    pub fn close(&self) {
        if let Some(store) = &self.store {
            store.close();
        }
    }

    /// Drop property values idle past their TTL
    pub fn evict_expired_properties(&self) -> usize {
        self.properties.evict_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordspace_common::config::CommitMode;
    use coordspace_common::{SpaceUri, Value};
    use coordspace_persistence::{CachePolicy, MemoryBackend, PersistenceManager};
    use coordspace_query::{CompareOp, Matchmaker};
    use std::sync::Arc;

    fn reference(name: &str) -> ContainerRef {
        ContainerRef::new(name, SpaceUri::parse("mem://test").unwrap())
    }

    fn ticket(price: i64) -> Entry {
        Entry::new("ticket", Value::map([("price", Value::from(price))]))
    }

    fn transient(indexes: &[IndexSpec]) -> Container {
        Container::open(reference("orders"), PropertyValueCache::default(), None, indexes).unwrap()
    }

    fn cheap() -> Query {
        Query::new(Matchmaker::compare("price", CompareOp::Lt, 10))
    }

    #[test]
    fn test_uncommitted_write_visible_only_to_writer() {
        let mut c = transient(&[]);
        let t1 = TxId::new(1);
        let t2 = TxId::new(2);
        let id = c.insert(ticket(5), t1).unwrap();

        assert_eq!(c.select(&cheap(), t1).unwrap().matches, vec![id]);
        let other = c.select(&cheap(), t2).unwrap();
        assert!(other.matches.is_empty());
        assert_eq!(other.holders, BTreeSet::from([t1]));

        c.commit_write(id, t1);
        assert_eq!(c.select(&cheap(), t2).unwrap().matches, vec![id]);
    }

    #[test]
    fn test_pending_take_locks_entry() {
        let mut c = transient(&[]);
        let t1 = TxId::new(1);
        let t2 = TxId::new(2);
        let id = c.insert(ticket(5), t1).unwrap();
        c.commit_write(id, t1);

        assert_eq!(c.take(id, t2).unwrap(), Some(TakeEffect::Pending));
        assert!(c.select(&cheap(), t2).unwrap().matches.is_empty());
        assert_eq!(c.select(&cheap(), TxId::new(3)).unwrap().holders, BTreeSet::from([t2]));

        c.rollback_take(id, t2);
        assert_eq!(c.select(&cheap(), TxId::new(3)).unwrap().matches, vec![id]);

        c.take(id, t2).unwrap();
        c.commit_take(id, t2);
        assert!(c.is_empty());
    }

    #[test]
    fn test_taking_own_write_discards_it() {
        let mut c = transient(&[IndexSpec::basic("price", IndexedKinds::All)]);
        let t1 = TxId::new(1);
        let id = c.insert(ticket(5), t1).unwrap();
        assert_eq!(c.take(id, t1).unwrap(), Some(TakeEffect::Discarded));
        assert!(c.is_empty());
        assert_eq!(c.take(id, t1).unwrap(), None);
    }

    #[test]
    fn test_limit_and_order() {
        let mut c = transient(&[IndexSpec::extended("price", IndexedKinds::All)]);
        let t = TxId::new(1);
        let ids: Vec<EntryId> = [3, 20, 1, 7]
            .into_iter()
            .map(|p| c.insert(ticket(p), t).unwrap())
            .collect();
        for id in &ids {
            c.commit_write(*id, t);
        }

        let all = c.select(&cheap(), TxId::new(2)).unwrap();
        assert_eq!(all.matches, vec![ids[0], ids[2], ids[3]]);
        let two = c.select(&cheap().with_limit(2), TxId::new(2)).unwrap();
        assert_eq!(two.matches, vec![ids[0], ids[2]]);
    }

    #[test]
    fn test_partial_index_coverage_scans_other_kinds() {
        let mut c = transient(&[IndexSpec::basic("price", IndexedKinds::only(["ticket"]))]);
        let t = TxId::new(1);
        let a = c.insert(ticket(5), t).unwrap();
        let b = c
            .insert(Entry::new("voucher", Value::map([("price", 5)])), t)
            .unwrap();
        c.commit_write(a, t);
        c.commit_write(b, t);

        let query = Query::new(Matchmaker::eq("price", 5));
        assert_eq!(c.select(&query, TxId::new(2)).unwrap().matches, vec![a, b]);
    }

    #[test]
    fn test_rollback_write_unindexes() {
        let mut c = transient(&[IndexSpec::basic("price", IndexedKinds::All)]);
        let t = TxId::new(1);
        let id = c.insert(ticket(5), t).unwrap();
        c.rollback_write(id, t);
        assert!(c.is_empty());
        assert!(c.select(&Query::new(Matchmaker::eq("price", 5)), t).unwrap().matches.is_empty());
    }

    #[test]
    fn test_clear_conflicts_with_locks() {
        let mut c = transient(&[]);
        let t = TxId::new(1);
        let id = c.insert(ticket(5), t).unwrap();
        let err = c.clear().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(c.len(), 1);

        c.commit_write(id, t);
        assert_eq!(c.clear().unwrap(), 1);
        assert!(c.is_empty());
    }

    #[test]
    fn test_recovery_from_stored_map() {
        let manager = PersistenceManager::new(Arc::new(MemoryBackend::new()), CommitMode::Sync);
        let open = |manager: &Arc<PersistenceManager>| {
            let store =
                StoredMap::open(manager.adapter(table_name("orders")), CachePolicy::Unbounded).unwrap();
            Container::open(
                reference("orders"),
                PropertyValueCache::default(),
                Some(store),
                &[IndexSpec::basic("price", IndexedKinds::All)],
            )
            .unwrap()
        };

        let t = TxId::new(1);
        let mut c = open(&manager);
        manager.begin(t);
        let id = c.insert(ticket(5), t).unwrap();
        manager.commit(t).unwrap();
        c.commit_write(id, t);
        c.close();

        let mut reopened = open(&manager);
        assert_eq!(reopened.resident(), 0);
        let query = Query::new(Matchmaker::eq("price", 5));
        assert_eq!(reopened.select(&query, TxId::new(2)).unwrap().matches, vec![id]);
        let t2 = TxId::new(2);
        manager.begin(t2);
        assert!(reopened.insert(ticket(6), t2).unwrap() > id);
    }

    fn stored(manager: &Arc<PersistenceManager>, policy: CachePolicy) -> Container {
        let store = StoredMap::open(manager.adapter(table_name("orders")), policy).unwrap();
        Container::open(reference("orders"), PropertyValueCache::default(), Some(store), &[]).unwrap()
    }

    fn committed(c: &mut Container, manager: &PersistenceManager, tx: TxId, price: i64) -> EntryId {
        manager.begin(tx);
        let id = c.insert(ticket(price), tx).unwrap();
        manager.commit(tx).unwrap();
        c.commit_write(id, tx);
        id
    }

    #[test]
    fn test_committed_entries_are_read_through_value_cache() {
        let manager = PersistenceManager::new(Arc::new(MemoryBackend::new()), CommitMode::Sync);
        let mut c = stored(&manager, CachePolicy::Unbounded);
        let t = TxId::new(1);
        manager.begin(t);
        let id = c.insert(ticket(5), t).unwrap();
        assert_eq!(c.resident(), 1);
        manager.commit(t).unwrap();
        c.commit_write(id, t);
        assert_eq!(c.resident(), 0);

        let stats = c.store.as_ref().unwrap().cache().stats();
        let before = stats.hits.load(std::sync::atomic::Ordering::Relaxed);
        for _ in 0..3 {
            assert_eq!(c.entry(id).unwrap().unwrap().as_ref(), &ticket(5));
        }
        let after = stats.hits.load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(after - before, 3);
    }

    #[test]
    fn test_uncached_reads_come_from_backend() {
        let manager = PersistenceManager::new(Arc::new(MemoryBackend::new()), CommitMode::Sync);
        let mut c = stored(&manager, CachePolicy::NoOp);
        let id = committed(&mut c, &manager, TxId::new(1), 5);

        assert_eq!(c.entry(id).unwrap().unwrap().as_ref(), &ticket(5));
        assert!(c.entry(EntryId::new(id.as_u64() + 1)).unwrap().is_none());
    }

    #[test]
    fn test_select_reloads_after_property_purge() {
        let manager = PersistenceManager::new(Arc::new(MemoryBackend::new()), CommitMode::Sync);
        let mut c = stored(&manager, CachePolicy::NoOp);
        let id = committed(&mut c, &manager, TxId::new(1), 5);
        committed(&mut c, &manager, TxId::new(2), 50);

        c.properties.purge(id);
        assert_eq!(c.select(&cheap(), TxId::new(3)).unwrap().matches, vec![id]);
    }

    #[test]
    fn test_missing_stored_value_fails_select() {
        let manager = PersistenceManager::new(Arc::new(MemoryBackend::new()), CommitMode::Sync);
        let mut c = stored(&manager, CachePolicy::NoOp);
        let id = committed(&mut c, &manager, TxId::new(1), 5);
        c.properties.purge(id);
        c.slots.insert(EntryId::new(id.as_u64() + 10), Slot::stored("ticket".to_string()));

        let err = c.select(&cheap(), TxId::new(2)).unwrap_err();
        assert!(matches!(err, PersistenceError::MissingValue { .. }));
    }
}
