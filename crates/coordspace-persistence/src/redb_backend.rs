//! redb backend (`redb` profile)
//!
//! One redb table per container, keys and values stored as raw bytes. A
//! commit batch is applied in a single write transaction; the commit mode
//! picks the transaction durability.

use crate::backend::{Backend, WriteOp};
use crate::error::{PersistenceError, PersistenceResult};
use coordspace_common::config::CommitMode;
use redb::{
    Database, Durability, ReadOnlyTable, ReadableTable, ReadableTableMetadata, TableDefinition,
    TableError, TableHandle,
};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

fn table_def(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

/// redb-backed storage
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open (or create) the database file
    pub fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        info!("Opened redb persistence backend at {}", path.display());
        Ok(Self { db })
    }

    fn open_read(&self, table: &str) -> PersistenceResult<ReadOnlyTable<&'static [u8], &'static [u8]>> {
        let read_txn = self.db.begin_read()?;
        match read_txn.open_table(table_def(table)) {
            Ok(t) => Ok(t),
            Err(TableError::TableDoesNotExist(_)) => {
                Err(PersistenceError::TableNotFound(table.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Backend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn create_table(&self, table: &str) -> PersistenceResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let _t = write_txn.open_table(table_def(table))?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn drop_table(&self, table: &str) -> PersistenceResult<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = write_txn.delete_table(table_def(table))?;
        write_txn.commit()?;
        Ok(existed)
    }

    fn table_exists(&self, table: &str) -> PersistenceResult<bool> {
        match self.open_read(table) {
            Ok(_) => Ok(true),
            Err(PersistenceError::TableNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get(&self, table: &str, key: &[u8]) -> PersistenceResult<Option<Vec<u8>>> {
        let t = self.open_read(table)?;
        Ok(t.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan(&self, table: &str) -> PersistenceResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let t = self.open_read(table)?;
        let mut rows = Vec::new();
        for item in t.iter()? {
            let (k, v) = item?;
            rows.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(rows)
    }

    fn keys(&self, table: &str) -> PersistenceResult<Vec<Vec<u8>>> {
        let t = self.open_read(table)?;
        let mut keys = Vec::new();
        for item in t.iter()? {
            let (k, _) = item?;
            keys.push(k.value().to_vec());
        }
        Ok(keys)
    }

    fn count(&self, table: &str) -> PersistenceResult<u64> {
        Ok(self.open_read(table)?.len()?)
    }

    fn clear(&self, table: &str) -> PersistenceResult<()> {
        let write_txn = self.db.begin_write()?;
        if !write_txn.delete_table(table_def(table))? {
            write_txn.abort()?;
            return Err(PersistenceError::TableNotFound(table.to_string()));
        }
        {
            let _t = write_txn.open_table(table_def(table))?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn apply(&self, batch: &[WriteOp], mode: CommitMode) -> PersistenceResult<()> {
        let mut write_txn = self.db.begin_write()?;
        write_txn.set_durability(match mode {
            CommitMode::Sync => Durability::Immediate,
            CommitMode::Async => Durability::Eventual,
        });

        let existing: HashSet<String> = write_txn
            .list_tables()?
            .map(|h| h.name().to_string())
            .collect();

        // per-table order is preserved; tables are independent of each other
        let mut grouped: BTreeMap<&str, Vec<&WriteOp>> = BTreeMap::new();
        for op in batch {
            grouped.entry(op.table()).or_default().push(op);
        }
        if let Some(missing) = grouped.keys().find(|t| !existing.contains(**t)) {
            let missing = (*missing).to_string();
            write_txn.abort()?;
            return Err(PersistenceError::TableNotFound(missing));
        }

        for (name, ops) in &grouped {
            let mut t = write_txn.open_table(table_def(name))?;
            for op in ops {
                match op {
                    WriteOp::Put { key, value, .. } => {
                        t.insert(key.as_slice(), value.as_slice())?;
                    }
                    WriteOp::Delete { key, .. } => {
                        t.remove(key.as_slice())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        debug!("Committed {} operation(s) across {} table(s)", batch.len(), grouped.len());
        Ok(())
    }
}
