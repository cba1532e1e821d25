//! Persistence adapter
//!
//! [`PersistenceManager`] wraps a [`Backend`] with per-transaction pending
//! logs: writes issued under a transaction are buffered and applied in one
//! backend commit when the transaction commits, or dropped on rollback.
//! Writes without a transaction commit immediately.
//!
//! Each container gets a [`TableAdapter`], the [`PersistenceAdapter`] for its
//! own table.

use crate::backend::{Backend, WriteOp};
use crate::error::{PersistenceError, PersistenceResult};
use crate::key::PersistenceKey;
use coordspace_common::TxId;
use coordspace_common::config::CommitMode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Durable key/value slots of one container
pub trait PersistenceAdapter<K: PersistenceKey>: Send + Sync {
    /// Create the backing table if needed
    fn init(&self) -> PersistenceResult<()>;

    /// Committed value of a key
    fn get(&self, key: &K) -> PersistenceResult<Option<Vec<u8>>>;

    /// Write a value; buffered until commit when `tx` is given
    fn put(&self, key: &K, value: Vec<u8>, tx: Option<TxId>) -> PersistenceResult<()>;

    /// Delete a key; buffered until commit when `tx` is given
    fn delete(&self, key: &K, tx: Option<TxId>) -> PersistenceResult<()>;

    /// All committed keys, in byte order
    fn key_set(&self) -> PersistenceResult<Vec<K>>;

    /// Number of committed keys
    fn count(&self) -> PersistenceResult<u64>;

    /// Remove all committed keys
    ///
    /// Fails with a retryable [`PersistenceError::LockConflict`], leaving the
    /// data intact, while any open transaction has pending writes on this
    /// table.
    fn clear(&self) -> PersistenceResult<()>;

    /// Drop the backing table and close the adapter
    fn destroy(&self) -> PersistenceResult<()>;

    /// Release the adapter; later calls fail with `Closed`
    fn close(&self);
}

/// Backend plus the pending logs of open transactions
pub struct PersistenceManager {
    backend: Arc<dyn Backend>,
    commit_mode: CommitMode,
    pending: Mutex<HashMap<TxId, Vec<WriteOp>>>,
}

impl PersistenceManager {
    pub fn new(backend: Arc<dyn Backend>, commit_mode: CommitMode) -> Arc<Self> {
        info!(
            "Persistence backend '{}' ready (commit mode {:?})",
            backend.name(),
            commit_mode
        );
        Arc::new(Self {
            backend,
            commit_mode,
            pending: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub const fn commit_mode(&self) -> CommitMode {
        self.commit_mode
    }

    /// Adapter for one table
    #[must_use]
    pub fn adapter<K: PersistenceKey>(self: &Arc<Self>, table: impl Into<String>) -> TableAdapter<K> {
        TableAdapter {
            manager: Arc::clone(self),
            table: table.into(),
            closed: AtomicBool::new(false),
            _key: PhantomData,
        }
    }

    /// Whether a table already exists in the backend (used for recovery)
    pub fn table_exists(&self, table: &str) -> PersistenceResult<bool> {
        self.backend.table_exists(table)
    }

    /// Open a pending log for a transaction
    pub fn begin(&self, tx: TxId) {
        self.pending.lock().entry(tx).or_default();
    }

    #[must_use]
    pub fn is_open(&self, tx: TxId) -> bool {
        self.pending.lock().contains_key(&tx)
    }

    /// Apply a transaction's pending writes in one backend commit
    pub fn commit(&self, tx: TxId) -> PersistenceResult<()> {
        let ops = self
            .pending
            .lock()
            .remove(&tx)
            .ok_or(PersistenceError::UnknownTransaction(tx))?;
        if ops.is_empty() {
            return Ok(());
        }
        debug!("Committing transaction {} ({} writes)", tx, ops.len());
        self.backend.apply(&ops, self.commit_mode)
    }

    /// Drop a transaction's pending writes
    pub fn rollback(&self, tx: TxId) {
        if let Some(ops) = self.pending.lock().remove(&tx) {
            debug!("Rolled back transaction {} ({} writes dropped)", tx, ops.len());
        }
    }

    fn write(&self, op: WriteOp, tx: Option<TxId>) -> PersistenceResult<()> {
        match tx {
            Some(tx) => {
                let mut pending = self.pending.lock();
                let log = pending
                    .get_mut(&tx)
                    .ok_or(PersistenceError::UnknownTransaction(tx))?;
                log.push(op);
                Ok(())
            }
            None => self.backend.apply(&[op], self.commit_mode),
        }
    }

    fn transactions_touching(&self, table: &str) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|ops| ops.iter().any(|op| op.table() == table))
            .count()
    }

    fn discard_table(&self, table: &str) {
        for ops in self.pending.lock().values_mut() {
            ops.retain(|op| op.table() != table);
        }
    }
}

/// [`PersistenceAdapter`] over one backend table
pub struct TableAdapter<K> {
    manager: Arc<PersistenceManager>,
    table: String,
    closed: AtomicBool,
    _key: PhantomData<fn() -> K>,
}

impl<K> TableAdapter<K> {
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    fn check_open(&self) -> PersistenceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PersistenceError::Closed(self.table.clone()))
        } else {
            Ok(())
        }
    }
}

impl<K: PersistenceKey> PersistenceAdapter<K> for TableAdapter<K> {
    fn init(&self) -> PersistenceResult<()> {
        self.check_open()?;
        self.manager.backend.create_table(&self.table)
    }

    fn get(&self, key: &K) -> PersistenceResult<Option<Vec<u8>>> {
        self.check_open()?;
        self.manager.backend.get(&self.table, &key.to_bytes())
    }

    fn put(&self, key: &K, value: Vec<u8>, tx: Option<TxId>) -> PersistenceResult<()> {
        self.check_open()?;
        self.manager.write(
            WriteOp::Put {
                table: self.table.clone(),
                key: key.to_bytes(),
                value,
            },
            tx,
        )
    }

    fn delete(&self, key: &K, tx: Option<TxId>) -> PersistenceResult<()> {
        self.check_open()?;
        self.manager.write(
            WriteOp::Delete {
                table: self.table.clone(),
                key: key.to_bytes(),
            },
            tx,
        )
    }

    fn key_set(&self) -> PersistenceResult<Vec<K>> {
        self.check_open()?;
        self.manager
            .backend
            .keys(&self.table)?
            .iter()
            .map(|k| K::from_bytes(k))
            .collect()
    }

    fn count(&self) -> PersistenceResult<u64> {
        self.check_open()?;
        self.manager.backend.count(&self.table)
    }

    fn clear(&self) -> PersistenceResult<()> {
        self.check_open()?;
        let open = self.manager.transactions_touching(&self.table);
        if open > 0 {
            warn!(
                "Cannot clear '{}': {} transaction(s) still have pending writes",
                self.table, open
            );
            return Err(PersistenceError::LockConflict {
                table: self.table.clone(),
                transactions: open,
            });
        }
        self.manager.backend.clear(&self.table)
    }

    fn destroy(&self) -> PersistenceResult<()> {
        self.check_open()?;
        self.manager.discard_table(&self.table);
        self.manager.backend.drop_table(&self.table)?;
        self.close();
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl<K: PersistenceKey> TableAdapter<K> {
    /// All committed `(key, bytes)` pairs, for recovery
    pub fn load_all(&self) -> PersistenceResult<Vec<(K, Vec<u8>)>> {
        self.check_open()?;
        self.manager
            .backend
            .scan(&self.table)?
            .into_iter()
            .map(|(k, v)| Ok((K::from_bytes(&k)?, v)))
            .collect()
    }
}
