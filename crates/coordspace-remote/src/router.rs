//! Message router
//!
//! Every message arriving from a transport goes through the router. Requests
//! are tagged as remote before they reach the request handler; responses are
//! always passed to the response handler, whether or not anyone is waiting
//! for them.

use crate::error::{RemotingError, RemotingResult};
use async_trait::async_trait;
use coordspace_common::RequestRef;
use coordspace_proto::{Message, RequestMessage, ResponseMessage};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Consumer of incoming requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request; must not wait on the operation's outcome
    async fn handle_request(&self, request: RequestMessage);
}

/// Consumer of incoming responses
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle_response(&self, response: ResponseMessage);
}

/// Dispatches decoded messages to the request and response handlers
pub struct MessageRouter {
    request_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    response_handler: Arc<dyn ResponseHandler>,
}

impl MessageRouter {
    /// Router with a response handler and no request handler yet
    pub fn new(response_handler: Arc<dyn ResponseHandler>) -> Self {
        Self {
            request_handler: RwLock::new(None),
            response_handler,
        }
    }

    /// Install (or replace) the request handler
    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.request_handler.write() = Some(handler);
    }

    /// Route one message
    pub async fn distribute(&self, message: Message) {
        match message {
            Message::Request(mut request) => {
                request.context.set_remote(true);
                let handler = self.request_handler.read().clone();
                match handler {
                    Some(handler) => {
                        debug!(
                            "Routing {} request {}",
                            request.request.name(),
                            request.reference
                        );
                        handler.handle_request(request).await;
                    }
                    None => {
                        error!(
                            "No request handler installed, dropping {} request {}",
                            request.request.name(),
                            request.reference
                        );
                    }
                }
            }
            Message::Response(response) => {
                debug!("Routing response {}", response.reference);
                self.response_handler.handle_response(response).await;
            }
        }
    }

    /// Decode a wire frame and route it
    ///
    /// A frame that does not decode to a known message is a protocol
    /// violation and is rejected before any handler sees it.
    pub async fn distribute_frame(&self, frame: &[u8]) -> RemotingResult<()> {
        let message = Message::from_frame(frame)
            .map_err(|e| RemotingError::ProtocolViolation(e.to_string()))?;
        self.distribute(message).await;
        Ok(())
    }
}

/// Response handler that completes per-request waiters
///
/// Responses nobody registered for are counted and dropped.
#[derive(Default)]
pub struct ResponseWaiters {
    waiters: DashMap<RequestRef, oneshot::Sender<ResponseMessage>>,
    unmatched: AtomicU64,
}

impl ResponseWaiters {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in the response to a request
    pub fn register(&self, reference: RequestRef) -> oneshot::Receiver<ResponseMessage> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(reference, tx);
        rx
    }

    /// Stop waiting for a response
    pub fn forget(&self, reference: &RequestRef) {
        self.waiters.remove(reference);
    }

    /// Responses that arrived without a registered waiter
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

#[async_trait]
impl ResponseHandler for ResponseWaiters {
    async fn handle_response(&self, response: ResponseMessage) {
        match self.waiters.remove(&response.reference) {
            Some((_, waiter)) => {
                if waiter.send(response).is_err() {
                    debug!("Response waiter went away");
                }
            }
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                debug!("No waiter for response {}", response.reference);
            }
        }
    }
}
