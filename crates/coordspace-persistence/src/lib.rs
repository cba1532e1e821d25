//! Coordspace Persistence - durable entry storage
//!
//! Layers, bottom up:
//! - [`Backend`]: committed tables ([`MemoryBackend`], [`RedbBackend`])
//! - [`PersistenceManager`]: per-transaction pending logs, atomic commit
//! - [`PersistenceAdapter`]: one container's durable slots
//! - [`ValueCache`]: optional cache in front of the adapter
//! - [`StoredMap`]: typed map tying adapter, cache and codec together

pub mod adapter;
pub mod backend;
pub mod cache;
pub mod error;
pub mod key;
pub mod memory;
pub mod redb_backend;
pub mod stored_map;

pub use adapter::{PersistenceAdapter, PersistenceManager, TableAdapter};
pub use backend::{Backend, OpenError, WriteOp, open_backend};
pub use cache::{CachePolicy, CacheStats, NoOpCache, UnboundedCache, ValueCache};
#[cfg(feature = "lru-cache")]
pub use cache::LruCache;
pub use error::{PersistenceError, PersistenceResult};
pub use key::{EntryKeyFactory, PersistenceKey};
pub use memory::MemoryBackend;
pub use redb_backend::RedbBackend;
pub use stored_map::StoredMap;
