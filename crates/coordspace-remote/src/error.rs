//! Remoting error types

use coordspace_proto::SerializationError;
use thiserror::Error;

pub type RemotingResult<T> = Result<T, RemotingError>;

/// Failure of a single send or dispatch
#[derive(Debug, Error)]
pub enum RemotingError {
    #[error("no sender for scheme '{0}'")]
    NoSender(String),

    #[error("no endpoint bound for '{0}'")]
    UnknownDestination(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{0} is closed")]
    Closed(String),

    #[error("codec error: {0}")]
    Serialization(#[from] SerializationError),
}
