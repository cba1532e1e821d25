//! Send manager
//!
//! Picks a sender by the destination URI's scheme, falling back to the
//! default scheme for URIs without one, and keeps the receivers so they can
//! be shut down together with the senders.

use crate::error::{RemotingError, RemotingResult};
use async_trait::async_trait;
use coordspace_common::SpaceUri;
use coordspace_proto::Message;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Outgoing transport for one scheme
#[async_trait]
pub trait Sender: Send + Sync {
    /// URI scheme this sender serves
    fn scheme(&self) -> &str;

    async fn send(&self, message: &Message) -> RemotingResult<()>;

    async fn shutdown(&self);
}

/// Incoming transport endpoint
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Address the receiver is bound to, for logs
    fn address(&self) -> String;

    async fn shutdown(&self);
}

/// Registry of senders and receivers
pub struct SendManager {
    senders: DashMap<String, Arc<dyn Sender>>,
    receivers: Mutex<Vec<Arc<dyn Receiver>>>,
    default_scheme: String,
    sent: AtomicU64,
    closed: AtomicBool,
}

impl SendManager {
    pub fn new(default_scheme: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            senders: DashMap::new(),
            receivers: Mutex::new(Vec::new()),
            default_scheme: default_scheme.into(),
            sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn default_scheme(&self) -> &str {
        &self.default_scheme
    }

    /// Register a sender for its scheme, replacing any previous one
    pub fn register_sender(&self, sender: Arc<dyn Sender>) {
        let scheme = sender.scheme().to_string();
        debug!("Registered sender for scheme '{}'", scheme);
        self.senders.insert(scheme, sender);
    }

    /// Track a receiver so [`SendManager::shutdown`] stops it
    pub fn register_receiver(&self, receiver: Arc<dyn Receiver>) {
        debug!("Registered receiver at {}", receiver.address());
        self.receivers.lock().push(receiver);
    }

    /// Sender for a destination
    pub fn sender_for(&self, destination: &SpaceUri) -> RemotingResult<Arc<dyn Sender>> {
        let scheme = destination.scheme().unwrap_or(&self.default_scheme);
        self.senders
            .get(scheme)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| RemotingError::NoSender(scheme.to_string()))
    }

    /// Send a message to its destination
    pub async fn send(&self, message: &Message) -> RemotingResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemotingError::Closed("send manager".to_string()));
        }
        let sender = self.sender_for(message.destination())?;
        sender.send(message).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of messages sent successfully
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Stop receivers first, then senders; later sends fail with `Closed`
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let receivers: Vec<_> = self.receivers.lock().drain(..).collect();
        for receiver in receivers {
            receiver.shutdown().await;
        }
        let senders: Vec<_> = self.senders.iter().map(|s| Arc::clone(s.value())).collect();
        self.senders.clear();
        for sender in senders {
            sender.shutdown().await;
        }
        info!("Send manager shut down");
    }
}
