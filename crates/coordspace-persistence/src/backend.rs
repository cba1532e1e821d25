//! Physical storage backends
//!
//! A backend stores committed bytes in named tables and applies a batch of
//! writes atomically. Transactions, pending logs and lock conflicts are
//! handled one level up, in [`crate::adapter::PersistenceManager`].

use crate::error::PersistenceResult;
use crate::memory::MemoryBackend;
use crate::redb_backend::RedbBackend;
use coordspace_common::config::{CommitMode, PersistenceConfig, PersistenceProfile};
use coordspace_common::Error as ConfigError;
use std::sync::Arc;

/// One mutation inside a commit batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        table: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: String,
        key: Vec<u8>,
    },
}

impl WriteOp {
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Put { table, .. } | Self::Delete { table, .. } => table,
        }
    }
}

/// Committed-state storage
pub trait Backend: Send + Sync {
    /// Profile name, for logs
    fn name(&self) -> &'static str;

    /// Create a table if it does not exist
    fn create_table(&self, table: &str) -> PersistenceResult<()>;

    /// Drop a table; returns whether it existed
    fn drop_table(&self, table: &str) -> PersistenceResult<bool>;

    fn table_exists(&self, table: &str) -> PersistenceResult<bool>;

    fn get(&self, table: &str, key: &[u8]) -> PersistenceResult<Option<Vec<u8>>>;

    /// All `(key, value)` pairs of a table in key order
    fn scan(&self, table: &str) -> PersistenceResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn keys(&self, table: &str) -> PersistenceResult<Vec<Vec<u8>>>;

    fn count(&self, table: &str) -> PersistenceResult<u64>;

    /// Remove every row of a table, keeping the table
    fn clear(&self, table: &str) -> PersistenceResult<()>;

    /// Apply all operations in one atomic commit
    fn apply(&self, batch: &[WriteOp], mode: CommitMode) -> PersistenceResult<()>;
}

/// Open the backend selected by the persistence profile
pub fn open_backend(config: &PersistenceConfig) -> Result<Arc<dyn Backend>, OpenError> {
    match config.profile {
        PersistenceProfile::InMemory => Ok(Arc::new(MemoryBackend::new())),
        PersistenceProfile::Redb => {
            let path = config.path.as_ref().ok_or_else(|| {
                ConfigError::configuration("persistence.path is required for the redb profile")
            })?;
            Ok(Arc::new(RedbBackend::open(path)?))
        }
    }
}

/// Failure to open a backend
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] crate::error::PersistenceError),
}
