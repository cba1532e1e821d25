//! Typed map over a persistence adapter, a value cache and the codec

use crate::adapter::{PersistenceAdapter, TableAdapter};
use crate::cache::{CachePolicy, ValueCache};
use crate::error::PersistenceResult;
use crate::key::PersistenceKey;
use coordspace_common::TxId;
use coordspace_proto::Codec;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Persistent map of decoded values
///
/// Reads go to the cache first and fall back to the adapter. Writes update
/// the cache and then the adapter; a transactional write whose transaction
/// rolls back must be followed by [`StoredMap::rollback_key`] so the cache
/// stops serving the discarded value.
pub struct StoredMap<K: PersistenceKey, V> {
    adapter: TableAdapter<K>,
    cache: Box<dyn ValueCache<K, V>>,
    codec: Codec,
}

impl<K, V> StoredMap<K, V>
where
    K: PersistenceKey,
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Wrap an adapter; creates its table
    pub fn open(adapter: TableAdapter<K>, policy: CachePolicy) -> PersistenceResult<Self> {
        adapter.init()?;
        Ok(Self {
            adapter,
            cache: policy.build(),
            codec: Codec::new(),
        })
    }

    #[must_use]
    pub const fn adapter(&self) -> &TableAdapter<K> {
        &self.adapter
    }

    #[must_use]
    pub fn cache(&self) -> &dyn ValueCache<K, V> {
        self.cache.as_ref()
    }

    pub fn get(&self, key: &K) -> PersistenceResult<Option<V>> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }
        let Some(bytes) = self.adapter.get(key)? else {
            return Ok(None);
        };
        let value: V = self.codec.deserialize(&bytes)?;
        self.cache.put(key.clone(), value.clone());
        Ok(Some(value))
    }

    pub fn put(&mut self, key: K, value: &V, tx: Option<TxId>) -> PersistenceResult<()> {
        let bytes = self.codec.serialize(value)?;
        self.cache.put(key.clone(), value.clone());
        self.adapter.put(&key, bytes, tx)
    }

    pub fn remove(&self, key: &K, tx: Option<TxId>) -> PersistenceResult<()> {
        self.cache.delete(key);
        self.adapter.delete(key, tx)
    }

    /// Forget the cached value of a key written by a rolled-back transaction
    pub fn rollback_key(&self, key: &K) {
        self.cache.delete(key);
    }

    pub fn keys(&self) -> PersistenceResult<Vec<K>> {
        self.adapter.key_set()
    }

    pub fn len(&self) -> PersistenceResult<u64> {
        self.adapter.count()
    }

    pub fn is_empty(&self) -> PersistenceResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Decode every committed value, in key order
    pub fn load_all(&self) -> PersistenceResult<Vec<(K, V)>> {
        self.adapter
            .load_all()?
            .into_iter()
            .map(|(k, bytes)| Ok((k, self.codec.deserialize(&bytes)?)))
            .collect()
    }

    pub fn clear(&self) -> PersistenceResult<()> {
        self.adapter.clear()?;
        self.cache.clear();
        Ok(())
    }

    pub fn destroy(&self) -> PersistenceResult<()> {
        self.cache.clear();
        self.adapter.destroy()
    }

    pub fn close(&self) {
        self.cache.clear();
        self.adapter.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PersistenceManager;
    use crate::memory::MemoryBackend;
    use crate::redb_backend::RedbBackend;
    use coordspace_common::config::CommitMode;
    use coordspace_common::{Entry, EntryId, Value};
    use std::sync::Arc;

    fn ticket(price: i64) -> Entry {
        Entry::new("ticket", Value::map([("price", Value::from(price))]))
    }

    #[test]
    fn test_put_get_remove() {
        let manager = PersistenceManager::new(Arc::new(MemoryBackend::new()), CommitMode::Sync);
        let mut map: StoredMap<EntryId, Entry> =
            StoredMap::open(manager.adapter("orders"), CachePolicy::Unbounded).unwrap();

        map.put(EntryId::new(1), &ticket(10), None).unwrap();
        assert_eq!(map.get(&EntryId::new(1)).unwrap(), Some(ticket(10)));
        assert_eq!(map.cache().len(), 1);

        map.remove(&EntryId::new(1), None).unwrap();
        assert_eq!(map.get(&EntryId::new(1)).unwrap(), None);
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn test_rollback_invalidates_cache() {
        let manager = PersistenceManager::new(Arc::new(MemoryBackend::new()), CommitMode::Sync);
        let mut map: StoredMap<EntryId, Entry> =
            StoredMap::open(manager.adapter("orders"), CachePolicy::Unbounded).unwrap();

        let tx = TxId::new(1);
        manager.begin(tx);
        map.put(EntryId::new(1), &ticket(5), Some(tx)).unwrap();
        manager.rollback(tx);
        map.rollback_key(&EntryId::new(1));

        assert_eq!(map.get(&EntryId::new(1)).unwrap(), None);
    }

    #[test]
    fn test_cache_miss_reads_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.redb");
        {
            let backend = RedbBackend::open(&path).unwrap();
            let manager = PersistenceManager::new(Arc::new(backend), CommitMode::Sync);
            let mut map: StoredMap<EntryId, Entry> =
                StoredMap::open(manager.adapter("orders"), CachePolicy::NoOp).unwrap();
            map.put(EntryId::new(1), &ticket(1), None).unwrap();
            map.put(EntryId::new(2), &ticket(2), None).unwrap();
        }

        let backend = RedbBackend::open(&path).unwrap();
        let manager = PersistenceManager::new(Arc::new(backend), CommitMode::Sync);
        let map: StoredMap<EntryId, Entry> =
            StoredMap::open(manager.adapter("orders"), CachePolicy::Lru { capacity: 8 }).unwrap();
        assert_eq!(map.get(&EntryId::new(2)).unwrap(), Some(ticket(2)));
        assert_eq!(
            map.load_all().unwrap(),
            vec![(EntryId::new(1), ticket(1)), (EntryId::new(2), ticket(2))]
        );
        assert_eq!(map.keys().unwrap(), vec![EntryId::new(1), EntryId::new(2)]);
    }
}
