//! In-process transport (`mem` scheme)
//!
//! Endpoints are bound by URI authority on a shared [`LocalHub`]. Messages
//! travel as encoded frames over channels, so they go through the same codec
//! and router path a network transport would use.

use crate::error::{RemotingError, RemotingResult};
use crate::router::MessageRouter;
use crate::send::{Receiver, Sender};
use async_trait::async_trait;
use bytes::Bytes;
use coordspace_proto::Message;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Scheme served by the in-process transport
pub const LOCAL_SCHEME: &str = "mem";

/// Registry of bound in-process endpoints
#[derive(Default)]
pub struct LocalHub {
    endpoints: DashMap<String, mpsc::UnboundedSender<Bytes>>,
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sender delivering to endpoints of this hub
    #[must_use]
    pub fn sender(self: &Arc<Self>) -> Arc<LocalSender> {
        Arc::new(LocalSender {
            hub: Arc::clone(self),
        })
    }

    /// Bind an authority and feed its frames into `router`
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        self: &Arc<Self>,
        authority: &str,
        router: Arc<MessageRouter>,
    ) -> RemotingResult<Arc<LocalReceiver>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        match self.endpoints.entry(authority.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RemotingError::ProtocolViolation(format!(
                    "authority '{authority}' is already bound"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        let label = authority.to_string();
        let task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = router.distribute_frame(&frame).await {
                    warn!("Dropping frame for '{}': {}", label, e);
                }
            }
            debug!("Receive loop for '{}' finished", label);
        });

        info!("Bound in-process endpoint '{}'", authority);
        Ok(Arc::new(LocalReceiver {
            hub: Arc::clone(self),
            authority: authority.to_string(),
            task: Mutex::new(Some(task)),
        }))
    }

    fn deliver(&self, authority: &str, frame: Bytes) -> RemotingResult<()> {
        let endpoint = self
            .endpoints
            .get(authority)
            .ok_or_else(|| RemotingError::UnknownDestination(authority.to_string()))?;
        endpoint
            .send(frame)
            .map_err(|_| RemotingError::Closed(format!("endpoint '{authority}'")))
    }

    fn unbind(&self, authority: &str) {
        self.endpoints.remove(authority);
    }
}

/// [`Sender`] for the `mem` scheme
pub struct LocalSender {
    hub: Arc<LocalHub>,
}

#[async_trait]
impl Sender for LocalSender {
    fn scheme(&self) -> &str {
        LOCAL_SCHEME
    }

    async fn send(&self, message: &Message) -> RemotingResult<()> {
        let frame = Bytes::from(message.to_frame()?);
        self.hub.deliver(message.destination().authority(), frame)
    }

    async fn shutdown(&self) {
        debug!("In-process sender shut down");
    }
}

/// A bound in-process endpoint
pub struct LocalReceiver {
    hub: Arc<LocalHub>,
    authority: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Receiver for LocalReceiver {
    fn address(&self) -> String {
        format!("{LOCAL_SCHEME}://{}", self.authority)
    }

    async fn shutdown(&self) {
        self.hub.unbind(&self.authority);
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        info!("Unbound in-process endpoint '{}'", self.authority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{RequestHandler, ResponseWaiters};
    use crate::send::SendManager;
    use coordspace_common::{RequestRef, SpaceUri};
    use coordspace_proto::{Request, RequestContext, RequestMessage, ResponseBody, ResponseMessage};
    use tokio::sync::mpsc::UnboundedSender;

    struct Echo {
        sends: Arc<SendManager>,
    }

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle_request(&self, request: RequestMessage) {
            assert!(request.context.is_remote());
            let Some(reply_to) = request.reply_to else {
                return;
            };
            let response = Message::Response(ResponseMessage {
                reference: request.reference,
                destination: reply_to,
                result: Ok(ResponseBody::Done),
            });
            self.sends.send(&response).await.unwrap();
        }
    }

    struct Forward(UnboundedSender<RequestMessage>);

    #[async_trait]
    impl RequestHandler for Forward {
        async fn handle_request(&self, request: RequestMessage) {
            let _ = self.0.send(request);
        }
    }

    fn uri(s: &str) -> SpaceUri {
        SpaceUri::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let hub = LocalHub::new();

        // server side
        let server_sends = SendManager::new(LOCAL_SCHEME);
        server_sends.register_sender(hub.sender());
        let server_router = Arc::new(MessageRouter::new(ResponseWaiters::new()));
        server_router.set_request_handler(Arc::new(Echo {
            sends: server_sends.clone(),
        }));
        let server_rx = hub.bind("server", server_router).unwrap();
        server_sends.register_receiver(server_rx);

        // client side
        let client_sends = SendManager::new(LOCAL_SCHEME);
        client_sends.register_sender(hub.sender());
        let waiters = ResponseWaiters::new();
        let client_router = Arc::new(MessageRouter::new(waiters.clone()));
        let client_rx = hub.bind("client", client_router).unwrap();
        client_sends.register_receiver(client_rx);

        let reference = RequestRef::new("r1", uri("mem://client"));
        let pending = waiters.register(reference.clone());
        let request = Message::Request(RequestMessage {
            reference: reference.clone(),
            destination: uri("mem://server"),
            reply_to: Some(uri("mem://client")),
            request: Request::BeginTransaction,
            context: RequestContext::new(),
        });
        client_sends.send(&request).await.unwrap();

        let response = pending.await.unwrap();
        assert_eq!(response.reference, reference);
        assert_eq!(response.result, Ok(ResponseBody::Done));
        assert_eq!(client_sends.sent_count(), 1);
        assert_eq!(server_sends.sent_count(), 1);

        server_sends.shutdown().await;
        assert!(matches!(
            client_sends.send(&request).await,
            Err(RemotingError::UnknownDestination(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_bind_rejected() {
        let hub = LocalHub::new();
        let router = Arc::new(MessageRouter::new(ResponseWaiters::new()));
        let _rx = hub.bind("a", router.clone()).unwrap();
        assert!(hub.bind("a", router).is_err());
    }

    #[tokio::test]
    async fn test_remote_flag_set_across_transport() {
        let hub = LocalHub::new();
        let (tx, mut seen) = mpsc::unbounded_channel();
        let router = Arc::new(MessageRouter::new(ResponseWaiters::new()));
        router.set_request_handler(Arc::new(Forward(tx)));
        let _rx = hub.bind("space", router).unwrap();

        let sender = hub.sender();
        sender
            .send(&Message::Request(RequestMessage {
                reference: RequestRef::new("r", uri("mem://x")),
                destination: uri("mem://space/orders"),
                reply_to: None,
                request: Request::BeginTransaction,
                context: RequestContext::new(),
            }))
            .await
            .unwrap();

        let request = seen.recv().await.unwrap();
        assert!(request.context.is_remote());
    }
}
