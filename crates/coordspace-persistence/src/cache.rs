//! Value caches in front of a persistence adapter
//!
//! The cache is a hint only: on a miss the adapter is authoritative. The
//! policy is chosen once from configuration ([`CachePolicy::resolve`]) and
//! handed to the stored map at construction.

use coordspace_common::config::{CacheConfig, CachePolicyConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of entries evicted
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

/// Key/value cache
pub trait ValueCache<K, V>: Send + Sync {
    fn put(&self, key: K, value: V);

    fn get(&self, key: &K) -> Option<V>;

    fn delete(&self, key: &K);

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> &CacheStats;
}

/// Cache that never holds anything
#[derive(Debug, Default)]
pub struct NoOpCache {
    stats: CacheStats,
}

impl<K, V> ValueCache<K, V> for NoOpCache {
    fn put(&self, _key: K, _value: V) {}

    fn get(&self, _key: &K) -> Option<V> {
        self.stats.miss();
        None
    }

    fn delete(&self, _key: &K) {}

    fn clear(&self) {}

    fn len(&self) -> usize {
        0
    }

    fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Unbounded best-effort cache
#[derive(Debug)]
pub struct UnboundedCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
    stats: CacheStats,
}

impl<K, V> UnboundedCache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }
}

impl<K, V> Default for UnboundedCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ValueCache<K, V> for UnboundedCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn put(&self, key: K, value: V) {
        self.entries.write().insert(key, value);
    }

    fn get(&self, key: &K) -> Option<V> {
        let value = self.entries.read().get(key).cloned();
        if value.is_some() {
            self.stats.hit();
        } else {
            self.stats.miss();
        }
        value
    }

    fn delete(&self, key: &K) {
        self.entries.write().remove(key);
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(feature = "lru-cache")]
pub use lru::LruCache;

#[cfg(feature = "lru-cache")]
mod lru {
    use super::{CacheStats, ValueCache};
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::hash::Hash;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CacheEntry<V> {
        value: V,
        /// Logical clock value of the last access
        last_access: AtomicU64,
    }

    /// Bounded cache evicting the least recently used entry
    ///
    /// One lock guards the whole map; access order is tracked with a
    /// logical clock so reads only need the shared lock.
    pub struct LruCache<K, V> {
        entries: RwLock<HashMap<K, CacheEntry<V>>>,
        capacity: usize,
        clock: AtomicU64,
        stats: CacheStats,
    }

    impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
        /// Create a cache holding at most `capacity` values (minimum 1)
        #[must_use]
        pub fn new(capacity: usize) -> Self {
            Self {
                entries: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                clock: AtomicU64::new(0),
                stats: CacheStats::default(),
            }
        }

        #[must_use]
        pub const fn capacity(&self) -> usize {
            self.capacity
        }

        /// Check if a key is cached, without touching it
        pub fn contains(&self, key: &K) -> bool {
            self.entries.read().contains_key(key)
        }

        /// Advance the logical clock and return the new value
        fn tick(&self) -> u64 {
            self.clock.fetch_add(1, Ordering::Relaxed) + 1
        }

        fn find_lru_entry(entries: &HashMap<K, CacheEntry<V>>) -> Option<K> {
            entries
                .iter()
                .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone())
        }
    }

    impl<K, V> ValueCache<K, V> for LruCache<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync,
        V: Clone + Send + Sync,
    {
        fn put(&self, key: K, value: V) {
            let clock = self.tick();
            let mut entries = self.entries.write();

            if !entries.contains_key(&key) {
                while entries.len() >= self.capacity {
                    let Some(evict_key) = Self::find_lru_entry(&entries) else {
                        break;
                    };
                    entries.remove(&evict_key);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }

            entries.insert(
                key,
                CacheEntry {
                    value,
                    last_access: AtomicU64::new(clock),
                },
            );
        }

        fn get(&self, key: &K) -> Option<V> {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.stats.hit();
                Some(entry.value.clone())
            } else {
                self.stats.miss();
                None
            }
        }

        fn delete(&self, key: &K) {
            self.entries.write().remove(key);
        }

        fn clear(&self) {
            self.entries.write().clear();
        }

        fn len(&self) -> usize {
            self.entries.read().len()
        }

        fn stats(&self) -> &CacheStats {
            &self.stats
        }
    }
}

/// Resolved cache policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    NoOp,
    Lru { capacity: usize },
    Unbounded,
}

impl CachePolicy {
    /// Whether the bounded LRU cache is compiled into this build
    pub const LRU_AVAILABLE: bool = cfg!(feature = "lru-cache");

    /// Pick the policy for a configuration
    ///
    /// `lru` falls back to `unbounded` when the `lru-cache` feature is off.
    #[must_use]
    pub fn resolve(config: &CacheConfig) -> Self {
        let policy = match config.policy {
            CachePolicyConfig::None => Self::NoOp,
            CachePolicyConfig::Lru if Self::LRU_AVAILABLE => Self::Lru {
                capacity: config.capacity,
            },
            CachePolicyConfig::Lru | CachePolicyConfig::Unbounded => Self::Unbounded,
        };
        debug!("Value cache policy resolved to {:?}", policy);
        policy
    }

    /// Build a cache for this policy
    #[must_use]
    pub fn build<K, V>(self) -> Box<dyn ValueCache<K, V>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        match self {
            Self::NoOp => Box::new(NoOpCache::default()),
            #[cfg(feature = "lru-cache")]
            Self::Lru { capacity } => Box::new(LruCache::new(capacity)),
            #[cfg(not(feature = "lru-cache"))]
            Self::Lru { .. } => Box::new(UnboundedCache::new()),
            Self::Unbounded => Box::new(UnboundedCache::new()),
        }
    }
}
