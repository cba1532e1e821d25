//! Coordspace Remote - access to spaces across process boundaries
//!
//! - [`MessageRouter`]: decodes frames, tags requests as remote, dispatches
//!   to the request / response handlers
//! - [`SendManager`]: scheme-based sender selection, receiver lifecycle
//! - [`LocalHub`]: in-process `mem://` transport

pub mod error;
pub mod local;
pub mod router;
pub mod send;

pub use error::{RemotingError, RemotingResult};
pub use local::{LOCAL_SCHEME, LocalHub, LocalReceiver, LocalSender};
pub use router::{MessageRouter, RequestHandler, ResponseHandler, ResponseWaiters};
pub use send::{Receiver, SendManager, Sender};
