//! Protocol messages
//!
//! A wire frame is the codec encoding of a [`Message`]. Requests carry a
//! destination space, an optional reply address and a context property bag;
//! responses echo the request reference so the caller can correlate them.

use crate::codec::{self, SerializationResult};
use coordspace_common::{
    AspectRef, ContainerRef, Entry, EntryId, RequestRef, SpaceUri, TransactionRef, Value,
};
use coordspace_query::{IndexSpec, Query};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Context property: request arrived over a transport
pub const REMOTE_REQUEST: &str = "remoteRequest";
/// Context property: the caller asks for authorization checks
pub const AUTH_REQUIRED: &str = "authRequired";
/// Context property: caller identity
pub const IDENTITY: &str = "identity";
/// Context property: caller credential
pub const TOKEN: &str = "token";

/// Request context property bag
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext(BTreeMap<String, Value>);

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(Value::Bool(true)))
    }

    fn string(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.flag(REMOTE_REQUEST)
    }

    pub fn set_remote(&mut self, remote: bool) {
        self.set(REMOTE_REQUEST, remote);
    }

    /// Remote requests always require authorization
    #[must_use]
    pub fn is_authorization_required(&self) -> bool {
        self.is_remote() || self.flag(AUTH_REQUIRED)
    }

    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.string(IDENTITY)
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.string(TOKEN)
    }
}

/// How long a read/take/delete may wait for matching entries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeout {
    /// Fail immediately with "not available"
    #[default]
    TryOnce,
    /// Wait until matched or cancelled
    Infinite,
    /// Wait at most this many milliseconds
    Millis(u64),
}

impl Timeout {
    /// Wait bound; `None` means unbounded
    #[must_use]
    pub const fn as_duration(self) -> Option<Duration> {
        match self {
            Self::TryOnce => Some(Duration::ZERO),
            Self::Infinite => None,
            Self::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }

    #[must_use]
    pub const fn from_duration(d: Duration) -> Self {
        let ms = d.as_millis();
        if ms == 0 {
            Self::TryOnce
        } else if ms > u64::MAX as u128 {
            Self::Infinite
        } else {
            Self::Millis(ms as u64)
        }
    }
}

/// Entry operation a notification can observe
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Take,
    Delete,
    Write,
}

impl Operation {
    pub const ALL: [Self; 4] = [Self::Read, Self::Take, Self::Delete, Self::Write];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Take => "take",
            Self::Delete => "delete",
            Self::Write => "write",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Space operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    CreateContainer {
        name: String,
        persistent: bool,
        indexes: Vec<IndexSpec>,
    },
    LookupContainer {
        name: String,
    },
    DestroyContainer {
        container: ContainerRef,
    },
    BeginTransaction,
    CommitTransaction {
        tx: TransactionRef,
    },
    RollbackTransaction {
        tx: TransactionRef,
    },
    Write {
        container: ContainerRef,
        entries: Vec<Entry>,
        tx: Option<TransactionRef>,
    },
    Read {
        container: ContainerRef,
        query: Query,
        tx: Option<TransactionRef>,
        timeout: Timeout,
    },
    Take {
        container: ContainerRef,
        query: Query,
        tx: Option<TransactionRef>,
        timeout: Timeout,
    },
    Delete {
        container: ContainerRef,
        query: Query,
        tx: Option<TransactionRef>,
        timeout: Timeout,
    },
    /// Cancel a blocked request
    Cancel {
        request: RequestRef,
    },
    /// Observe operations on a container; events are taken from the
    /// returned notification container
    CreateNotification {
        container: ContainerRef,
        operations: Vec<Operation>,
    },
    RemoveAspect {
        aspect: AspectRef,
    },
}

impl Request {
    /// Operation name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateContainer { .. } => "create_container",
            Self::LookupContainer { .. } => "lookup_container",
            Self::DestroyContainer { .. } => "destroy_container",
            Self::BeginTransaction => "begin_transaction",
            Self::CommitTransaction { .. } => "commit_transaction",
            Self::RollbackTransaction { .. } => "rollback_transaction",
            Self::Write { .. } => "write",
            Self::Read { .. } => "read",
            Self::Take { .. } => "take",
            Self::Delete { .. } => "delete",
            Self::Cancel { .. } => "cancel",
            Self::CreateNotification { .. } => "create_notification",
            Self::RemoveAspect { .. } => "remove_aspect",
        }
    }

    /// Transaction the request runs in, if it names one
    #[must_use]
    pub const fn transaction(&self) -> Option<&TransactionRef> {
        match self {
            Self::CommitTransaction { tx } | Self::RollbackTransaction { tx } => Some(tx),
            Self::Write { tx, .. }
            | Self::Read { tx, .. }
            | Self::Take { tx, .. }
            | Self::Delete { tx, .. } => tx.as_ref(),
            _ => None,
        }
    }
}

/// Successful outcome of a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    Container(ContainerRef),
    Transaction(TransactionRef),
    Written(Vec<EntryId>),
    Entries(Vec<Entry>),
    Deleted(usize),
    /// Notification container and the aspect feeding it
    Notification {
        container: ContainerRef,
        aspect: AspectRef,
    },
    /// Timed out or cancelled without a match
    NotAvailable,
    Done,
}

/// Stable error category reported to remote callers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Persistence,
    LockConflict,
    Serialization,
    Remoting,
    QueryParse,
    InvalidUri,
    ContainerNotFound,
    ContainerExists,
    TransactionNotFound,
    TransactionNotActive,
    DeadlockVictim,
    AccessDenied,
    AspectRejected,
    AspectNotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error carried in a response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A request addressed to a space
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub reference: RequestRef,
    pub destination: SpaceUri,
    /// Where the response goes; `None` for fire-and-forget
    pub reply_to: Option<SpaceUri>,
    pub request: Request,
    pub context: RequestContext,
}

/// The answer to a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub reference: RequestRef,
    pub destination: SpaceUri,
    pub result: Result<ResponseBody, ErrorReport>,
}

/// Wire message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
}

impl Message {
    #[must_use]
    pub const fn destination(&self) -> &SpaceUri {
        match self {
            Self::Request(r) => &r.destination,
            Self::Response(r) => &r.destination,
        }
    }

    /// Encode as a wire frame
    pub fn to_frame(&self) -> SerializationResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decode a wire frame
    pub fn from_frame(frame: &[u8]) -> SerializationResult<Self> {
        codec::decode(frame)
    }
}

impl From<RequestMessage> for Message {
    fn from(m: RequestMessage) -> Self {
        Self::Request(m)
    }
}

impl From<ResponseMessage> for Message {
    fn from(m: ResponseMessage) -> Self {
        Self::Response(m)
    }
}
