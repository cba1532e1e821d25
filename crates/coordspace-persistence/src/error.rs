//! Persistence error types

use coordspace_common::TxId;
use coordspace_proto::SerializationError;
use thiserror::Error;

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Adapter-level failure
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("redb error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("table '{table}' has {transactions} open transaction(s) with pending writes")]
    LockConflict { table: String, transactions: usize },

    #[error("'{0}' is closed")]
    Closed(String),

    #[error("table '{0}' does not exist")]
    TableNotFound(String),

    #[error("transaction {0} is not open")]
    UnknownTransaction(TxId),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("no stored value for key {key} in table '{table}'")]
    MissingValue { table: String, key: String },
}

impl From<redb::TransactionError> for PersistenceError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl PersistenceError {
    /// Whether retrying the same call later can succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }
}
