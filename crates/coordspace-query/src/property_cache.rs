//! Property value cache
//!
//! Two-level cache `entry -> (property -> value)` in front of property
//! extraction. The outer level expires after the entry has not been touched
//! for `entry_ttl`, the inner level after a single property has not been
//! touched for `property_ttl`. A cached `Null` is a hit; [`CacheLookup::Miss`]
//! means nothing is cached.

use crate::property::PropertyPath;
use coordspace_common::{EntryId, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default idle time for an entry's property map
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(300);

/// Default idle time for a single property value
pub const DEFAULT_PROPERTY_TTL: Duration = Duration::from_secs(120);

/// Result of a cache lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    /// Cached value (possibly `Null`)
    Hit(Value),
    /// Nothing cached for this entry and property
    Miss,
}

struct PropertySlot {
    value: Value,
    last_access: Instant,
}

struct EntrySlot {
    properties: HashMap<PropertyPath, PropertySlot>,
    last_access: Instant,
}

impl EntrySlot {
    fn new(now: Instant) -> Self {
        Self {
            properties: HashMap::new(),
            last_access: now,
        }
    }
}

/// Property value cache
pub struct PropertyValueCache {
    entries: Mutex<HashMap<EntryId, EntrySlot>>,
    entry_ttl: Duration,
    property_ttl: Duration,
}

impl PropertyValueCache {
    /// Create a cache with explicit expiry windows
    #[must_use]
    pub fn new(entry_ttl: Duration, property_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            entry_ttl,
            property_ttl,
        }
    }

    /// Cache a property value
    pub fn insert(&self, entry: EntryId, property: &PropertyPath, value: Value) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let slot = entries.entry(entry).or_insert_with(|| EntrySlot::new(now));
        slot.last_access = now;
        slot.properties.insert(
            property.clone(),
            PropertySlot {
                value,
                last_access: now,
            },
        );
    }

    /// Look up a cached value without computing it
    pub fn lookup(&self, entry: EntryId, property: &PropertyPath) -> CacheLookup {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match self.touch(&mut entries, entry, property, now) {
            Some(value) => CacheLookup::Hit(value),
            None => CacheLookup::Miss,
        }
    }

    /// Return the cached value, or compute, cache and return it
    ///
    /// The lock is held across `compute`, so concurrent callers for the same
    /// (entry, property) pair run the extraction exactly once.
    pub fn get_or_compute<F>(&self, entry: EntryId, property: &PropertyPath, compute: F) -> Value
    where
        F: FnOnce() -> Value,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(value) = self.touch(&mut entries, entry, property, now) {
            return value;
        }

        let value = compute();
        let slot = entries.entry(entry).or_insert_with(|| EntrySlot::new(now));
        slot.last_access = now;
        slot.properties.insert(
            property.clone(),
            PropertySlot {
                value: value.clone(),
                last_access: now,
            },
        );
        value
    }

    /// Drop every cached value of an entry
    pub fn purge(&self, entry: EntryId) {
        self.entries.lock().remove(&entry);
    }

    /// Sweep expired entries and properties
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        let mut entries = self.entries.lock();
        entries.retain(|_, slot| {
            if now.duration_since(slot.last_access) >= self.entry_ttl {
                evicted += slot.properties.len();
                return false;
            }
            let before = slot.properties.len();
            slot.properties
                .retain(|_, prop| now.duration_since(prop.last_access) < self.property_ttl);
            evicted += before - slot.properties.len();
            true
        });
        evicted
    }

    /// Number of entries with cached properties
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    // Returns the live cached value and refreshes both access times, dropping
    // whatever level has expired.
    fn touch(
        &self,
        entries: &mut HashMap<EntryId, EntrySlot>,
        entry: EntryId,
        property: &PropertyPath,
        now: Instant,
    ) -> Option<Value> {
        let slot = entries.get_mut(&entry)?;
        if now.duration_since(slot.last_access) >= self.entry_ttl {
            entries.remove(&entry);
            return None;
        }
        slot.last_access = now;

        let prop = slot.properties.get_mut(property)?;
        if now.duration_since(prop.last_access) >= self.property_ttl {
            slot.properties.remove(property);
            return None;
        }
        prop.last_access = now;
        Some(prop.value.clone())
    }
}

impl Default for PropertyValueCache {
    fn default() -> Self {
        Self::new(DEFAULT_ENTRY_TTL, DEFAULT_PROPERTY_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn path(s: &str) -> PropertyPath {
        PropertyPath::parse(s)
    }

    #[test]
    fn test_null_is_a_hit() {
        let cache = PropertyValueCache::default();
        let e = EntryId::new(1);
        cache.insert(e, &path("seat"), Value::Null);

        assert_eq!(cache.lookup(e, &path("seat")), CacheLookup::Hit(Value::Null));
        assert_eq!(cache.lookup(e, &path("row")), CacheLookup::Miss);
        assert_eq!(cache.lookup(EntryId::new(2), &path("seat")), CacheLookup::Miss);
    }

    #[test]
    fn test_purge() {
        let cache = PropertyValueCache::default();
        let e = EntryId::new(1);
        cache.insert(e, &path("a"), Value::from(1));
        cache.insert(e, &path("b"), Value::from(2));
        assert_eq!(cache.len(), 1);

        cache.purge(e);
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(e, &path("a")), CacheLookup::Miss);
    }

    #[test]
    fn test_expiry() {
        let cache = PropertyValueCache::new(Duration::ZERO, Duration::ZERO);
        let e = EntryId::new(1);
        cache.insert(e, &path("a"), Value::from(1));
        assert_eq!(cache.lookup(e, &path("a")), CacheLookup::Miss);

        let cache = PropertyValueCache::new(Duration::from_secs(60), Duration::ZERO);
        cache.insert(e, &path("a"), Value::from(1));
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(e, &path("a")), CacheLookup::Miss);
    }

    #[test]
    fn test_get_or_compute_runs_once() {
        let cache = Arc::new(PropertyValueCache::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    cache.get_or_compute(EntryId::new(7), &path("price"), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Value::from(10)
                    })
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), Value::from(10));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.lookup(EntryId::new(7), &path("price")),
            CacheLookup::Hit(Value::from(10))
        );
    }
}
