//! Coordspace Proto - wire codec and protocol messages
//!
//! The codec is the single canonical way entries and messages are turned
//! into bytes and back, and also how entries are deep-copied before they are
//! handed to callers.

pub mod codec;
pub mod message;

pub use codec::{Codec, SerializationError, SerializationResult};
pub use message::{
    ErrorKind, ErrorReport, Message, Operation, Request, RequestContext, RequestMessage,
    ResponseBody, ResponseMessage, Timeout,
};
