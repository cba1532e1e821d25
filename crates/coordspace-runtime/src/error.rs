//! Space error types

use coordspace_common::TxId;
use coordspace_persistence::{OpenError, PersistenceError};
use coordspace_proto::{ErrorKind, ErrorReport, SerializationError};
use coordspace_query::QueryParseError;
use coordspace_remote::RemotingError;
use thiserror::Error;

use crate::transaction::TxStatus;

pub type SpaceResult<T> = Result<T, SpaceError>;

/// Failure of a space operation
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("remoting error: {0}")]
    Remoting(#[from] RemotingError),

    #[error("query parse error: {0}")]
    QueryParse(#[from] QueryParseError),

    #[error(transparent)]
    Common(#[from] coordspace_common::Error),

    #[error("container '{0}' not found")]
    ContainerNotFound(String),

    #[error("container '{0}' already exists")]
    ContainerExists(String),

    #[error("transaction '{0}' not found")]
    TransactionNotFound(String),

    #[error("transaction {tx} is {status}")]
    TransactionNotActive { tx: TxId, status: TxStatus },

    #[error("transaction {0} was aborted to resolve a deadlock")]
    DeadlockVictim(TxId),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("rejected by aspect: {0}")]
    AspectRejected(String),

    #[error("aspect '{0}' not found")]
    AspectNotFound(String),
}

impl From<OpenError> for SpaceError {
    fn from(e: OpenError) -> Self {
        match e {
            OpenError::Config(e) => Self::Common(e),
            OpenError::Persistence(e) => Self::Persistence(e),
        }
    }
}

impl SpaceError {
    /// Stable kind reported in responses
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Persistence(PersistenceError::LockConflict { .. }) => ErrorKind::LockConflict,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Remoting(_) => ErrorKind::Remoting,
            Self::QueryParse(_) => ErrorKind::QueryParse,
            Self::Common(coordspace_common::Error::InvalidUri { .. }) => ErrorKind::InvalidUri,
            // configuration and file errors only surface while opening a space
            Self::Common(_) => ErrorKind::Persistence,
            Self::ContainerNotFound(_) => ErrorKind::ContainerNotFound,
            Self::ContainerExists(_) => ErrorKind::ContainerExists,
            Self::TransactionNotFound(_) => ErrorKind::TransactionNotFound,
            Self::TransactionNotActive { .. } => ErrorKind::TransactionNotActive,
            Self::DeadlockVictim(_) => ErrorKind::DeadlockVictim,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::AspectRejected(_) => ErrorKind::AspectRejected,
            Self::AspectNotFound(_) => ErrorKind::AspectNotFound,
        }
    }

    /// Whether retrying the same call later can succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence(e) => e.is_retryable(),
            _ => false,
        }
    }

    #[must_use]
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport::new(self.kind(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_conflict_kind_and_retry() {
        let err = SpaceError::from(PersistenceError::LockConflict {
            table: "orders".to_string(),
            transactions: 1,
        });
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert!(err.is_retryable());
        assert!(!SpaceError::DeadlockVictim(TxId::new(3)).is_retryable());
    }

    #[test]
    fn test_report_carries_message() {
        let report = SpaceError::ContainerNotFound("orders".to_string()).to_report();
        assert_eq!(report.kind, ErrorKind::ContainerNotFound);
        assert!(report.message.contains("orders"));
    }
}
