//! Persistence keys
//!
//! A key has one fixed byte encoding: integers are 8-byte big-endian (so
//! byte order equals numeric order in the backing store), strings are UTF-8.

use crate::error::{PersistenceError, PersistenceResult};
use coordspace_common::EntryId;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte-serializable key of one durable slot
pub trait PersistenceKey: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static {
    fn to_bytes(&self) -> Vec<u8>;

    fn from_bytes(bytes: &[u8]) -> PersistenceResult<Self>;
}

impl PersistenceKey for u64 {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> PersistenceResult<Self> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| {
            PersistenceError::InvalidKey(format!("expected 8 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_be_bytes(arr))
    }
}

impl PersistenceKey for String {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> PersistenceResult<Self> {
        Self::from_utf8(bytes.to_vec()).map_err(|e| PersistenceError::InvalidKey(e.to_string()))
    }
}

impl PersistenceKey for EntryId {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_u64().to_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> PersistenceResult<Self> {
        u64::from_bytes(bytes).map(Self::new)
    }
}

/// Hands out entry keys in increasing order
///
/// Keys are never reused within one store generation: a factory for a
/// recovered container is seeded past the largest persisted key.
#[derive(Debug)]
pub struct EntryKeyFactory {
    next: AtomicU64,
}

impl EntryKeyFactory {
    /// Factory whose first key is 1
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Factory continuing after the largest existing key
    pub fn seeded<I: IntoIterator<Item = EntryId>>(existing: I) -> Self {
        let max = existing.into_iter().map(EntryId::as_u64).max().unwrap_or(0);
        Self {
            next: AtomicU64::new(max + 1),
        }
    }

    pub fn next_key(&self) -> EntryId {
        EntryId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// The key the next call will return
    pub fn peek(&self) -> EntryId {
        EntryId::new(self.next.load(Ordering::Relaxed))
    }
}

impl Default for EntryKeyFactory {
    fn default() -> Self {
        Self::new()
    }
}
