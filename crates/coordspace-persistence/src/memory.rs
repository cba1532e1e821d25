//! In-memory backend (`in-memory` profile)

use crate::backend::{Backend, WriteOp};
use crate::error::{PersistenceError, PersistenceResult};
use coordspace_common::config::CommitMode;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Tables kept in process memory; nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&Table) -> T) -> PersistenceResult<T> {
        let tables = self.tables.read();
        tables
            .get(table)
            .map(f)
            .ok_or_else(|| PersistenceError::TableNotFound(table.to_string()))
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn create_table(&self, table: &str) -> PersistenceResult<()> {
        self.tables.write().entry(table.to_string()).or_default();
        Ok(())
    }

    fn drop_table(&self, table: &str) -> PersistenceResult<bool> {
        Ok(self.tables.write().remove(table).is_some())
    }

    fn table_exists(&self, table: &str) -> PersistenceResult<bool> {
        Ok(self.tables.read().contains_key(table))
    }

    fn get(&self, table: &str, key: &[u8]) -> PersistenceResult<Option<Vec<u8>>> {
        self.with_table(table, |t| t.get(key).cloned())
    }

    fn scan(&self, table: &str) -> PersistenceResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.with_table(table, |t| {
            t.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        })
    }

    fn keys(&self, table: &str) -> PersistenceResult<Vec<Vec<u8>>> {
        self.with_table(table, |t| t.keys().cloned().collect())
    }

    fn count(&self, table: &str) -> PersistenceResult<u64> {
        self.with_table(table, |t| t.len() as u64)
    }

    fn clear(&self, table: &str) -> PersistenceResult<()> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| PersistenceError::TableNotFound(table.to_string()))?;
        t.clear();
        Ok(())
    }

    fn apply(&self, batch: &[WriteOp], _mode: CommitMode) -> PersistenceResult<()> {
        let mut tables = self.tables.write();
        // validate first so a batch is all-or-nothing
        if let Some(missing) = batch.iter().find(|op| !tables.contains_key(op.table())) {
            return Err(PersistenceError::TableNotFound(missing.table().to_string()));
        }
        for op in batch {
            match op {
                WriteOp::Put { table, key, value } => {
                    if let Some(t) = tables.get_mut(table) {
                        t.insert(key.clone(), value.clone());
                    }
                }
                WriteOp::Delete { table, key } => {
                    if let Some(t) = tables.get_mut(table) {
                        t.remove(key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(table: &str, key: u8, value: u8) -> WriteOp {
        WriteOp::Put {
            table: table.to_string(),
            key: vec![key],
            value: vec![value],
        }
    }

    #[test]
    fn test_apply_and_read() {
        let backend = MemoryBackend::new();
        backend.create_table("a").unwrap();
        backend
            .apply(&[put("a", 2, 20), put("a", 1, 10)], CommitMode::Sync)
            .unwrap();

        assert_eq!(backend.get("a", &[1]).unwrap(), Some(vec![10]));
        assert_eq!(backend.keys("a").unwrap(), vec![vec![1], vec![2]]);
        assert_eq!(backend.count("a").unwrap(), 2);

        backend
            .apply(
                &[WriteOp::Delete {
                    table: "a".into(),
                    key: vec![1],
                }],
                CommitMode::Async,
            )
            .unwrap();
        assert_eq!(backend.get("a", &[1]).unwrap(), None);
    }

    #[test]
    fn test_batch_to_missing_table_applies_nothing() {
        let backend = MemoryBackend::new();
        backend.create_table("a").unwrap();
        let err = backend
            .apply(&[put("a", 1, 1), put("b", 1, 1)], CommitMode::Sync)
            .unwrap_err();
        assert!(matches!(err, PersistenceError::TableNotFound(_)));
        assert_eq!(backend.count("a").unwrap(), 0);
    }

    #[test]
    fn test_drop_and_clear() {
        let backend = MemoryBackend::new();
        backend.create_table("a").unwrap();
        backend.apply(&[put("a", 1, 1)], CommitMode::Sync).unwrap();
        backend.clear("a").unwrap();
        assert_eq!(backend.count("a").unwrap(), 0);
        assert!(backend.drop_table("a").unwrap());
        assert!(!backend.table_exists("a").unwrap());
        assert!(backend.get("a", &[1]).is_err());
    }
}
