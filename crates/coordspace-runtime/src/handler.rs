//! Space request handler
//!
//! Bridges the message router to a [`Space`]. A request that names a
//! transaction joins that transaction's lane, a task running the lane's
//! requests one at a time in arrival order; the lane ends with the commit
//! or rollback. Every other request runs in its own task, so a blocking take
//! never holds up the receive loop. Outcomes are sent to the request's
//! `reply_to` address when there is one.

use crate::error::{SpaceError, SpaceResult};
use crate::space::{OpOptions, Outcome, Space};
use async_trait::async_trait;
use coordspace_common::{Entry, RequestRef, TransactionRef};
use coordspace_proto::{
    Message, Request, RequestContext, RequestMessage, ResponseBody, ResponseMessage, Timeout,
};
use coordspace_remote::{RequestHandler, SendManager};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Lanes = Arc<Mutex<HashMap<TransactionRef, mpsc::UnboundedSender<Job>>>>;

pub struct SpaceRequestHandler {
    space: Arc<Space>,
    sends: Arc<SendManager>,
    require_identity: bool,
    lanes: Lanes,
}

impl SpaceRequestHandler {
    pub fn new(space: Arc<Space>, sends: Arc<SendManager>, require_identity: bool) -> Arc<Self> {
        Arc::new(Self {
            space,
            sends,
            require_identity,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn authorize(&self, context: &RequestContext) -> SpaceResult<()> {
        if self.require_identity && context.is_authorization_required() && context.identity().is_none() {
            return Err(SpaceError::AccessDenied(
                "remote request carries no identity".to_string(),
            ));
        }
        Ok(())
    }

    /// Transactions with an open lane
    #[must_use]
    pub fn open_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Queue a job behind earlier requests of the same transaction
    fn enqueue(&self, tx: TransactionRef, job: Job) {
        let mut lanes = self.lanes.lock();
        let job = match lanes.get(&tx) {
            Some(lane) => match lane.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (sender, mut receiver) = mpsc::unbounded_channel();
        if sender.send(job).is_err() {
            return;
        }
        lanes.insert(tx.clone(), sender);
        drop(lanes);
        debug!("Opened request lane for transaction {}", tx);

        let lanes = Arc::clone(&self.lanes);
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let ends = job.ends_transaction();
                job.run().await;
                if ends && lanes.lock().remove(&tx).is_some() {
                    // requests queued before the removal still run in order
                    debug!("Closed request lane for transaction {}", tx);
                }
            }
        });
    }
}

/// One request with everything needed to answer it
struct Job {
    space: Arc<Space>,
    sends: Arc<SendManager>,
    authorized: SpaceResult<()>,
    message: RequestMessage,
}

impl Job {
    const fn ends_transaction(&self) -> bool {
        matches!(
            self.message.request,
            Request::CommitTransaction { .. } | Request::RollbackTransaction { .. }
        )
    }

    async fn run(self) {
        let RequestMessage {
            reference,
            reply_to,
            request,
            ..
        } = self.message;
        let name = request.name();
        let result = match self.authorized {
            Ok(()) => execute(&self.space, &reference, request).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!("{} request {} failed: {}", name, reference, e);
        }

        let Some(reply_to) = reply_to else {
            return;
        };
        let response = Message::Response(ResponseMessage {
            reference,
            destination: reply_to,
            result: result.map_err(|e| e.to_report()),
        });
        if let Err(e) = self.sends.send(&response).await {
            warn!("Could not deliver {} response: {}", name, e);
        }
    }
}

/// Run one request against a space
///
/// Waiting operations are registered for cancellation under `reference`.
pub async fn execute(
    space: &Space,
    reference: &RequestRef,
    request: Request,
) -> SpaceResult<ResponseBody> {
    let body = match request {
        Request::CreateContainer {
            name,
            persistent,
            indexes,
        } => ResponseBody::Container(space.create_container(&name, persistent, &indexes)?),
        Request::LookupContainer { name } => ResponseBody::Container(space.lookup_container(&name)?),
        Request::DestroyContainer { container } => {
            space.destroy_container(&container)?;
            ResponseBody::Done
        }
        Request::BeginTransaction => ResponseBody::Transaction(space.begin_transaction()),
        Request::CommitTransaction { tx } => {
            space.commit(&tx)?;
            ResponseBody::Done
        }
        Request::RollbackTransaction { tx } => {
            space.rollback(&tx)?;
            ResponseBody::Done
        }
        Request::Write {
            container,
            entries,
            tx,
        } => ResponseBody::Written(space.write(&container, entries, tx.as_ref())?),
        Request::Read {
            container,
            query,
            tx,
            timeout,
        } => {
            let options = options(reference, tx, timeout);
            entries_body(space.read(&container, &query, options).await?)
        }
        Request::Take {
            container,
            query,
            tx,
            timeout,
        } => {
            let options = options(reference, tx, timeout);
            entries_body(space.take(&container, &query, options).await?)
        }
        Request::Delete {
            container,
            query,
            tx,
            timeout,
        } => {
            let options = options(reference, tx, timeout);
            match space.delete(&container, &query, options).await? {
                Outcome::Done(count) => ResponseBody::Deleted(count),
                Outcome::NotAvailable => ResponseBody::NotAvailable,
            }
        }
        Request::Cancel { request } => {
            if !space.cancel(&request) {
                debug!("Nothing waiting under {}", request);
            }
            ResponseBody::Done
        }
        Request::CreateNotification {
            container,
            operations,
        } => {
            let (container, aspect) = space.create_notification(&container, &operations)?;
            ResponseBody::Notification { container, aspect }
        }
        Request::RemoveAspect { aspect } => {
            space.remove_aspect(&aspect)?;
            ResponseBody::Done
        }
    };
    Ok(body)
}

fn options(reference: &RequestRef, tx: Option<TransactionRef>, timeout: Timeout) -> OpOptions {
    OpOptions {
        tx,
        timeout,
        request: Some(reference.clone()),
    }
}

fn entries_body(outcome: Outcome<Vec<Entry>>) -> ResponseBody {
    match outcome {
        Outcome::Done(entries) => ResponseBody::Entries(entries),
        Outcome::NotAvailable => ResponseBody::NotAvailable,
    }
}

#[async_trait]
impl RequestHandler for SpaceRequestHandler {
    async fn handle_request(&self, message: RequestMessage) {
        let job = Job {
            space: Arc::clone(&self.space),
            sends: Arc::clone(&self.sends),
            authorized: self.authorize(&message.context),
            message,
        };
        match job.message.request.transaction().cloned() {
            Some(tx) => self.enqueue(tx, job),
            None => {
                tokio::spawn(job.run());
            }
        }
    }
}
