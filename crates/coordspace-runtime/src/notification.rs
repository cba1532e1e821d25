//! Notifications
//!
//! A notification observes operations on one container. Every observed
//! operation writes an event entry into a dedicated transient container,
//! inside the transaction of the operation, so an event becomes visible
//! exactly when the operation it reports commits. Listeners take events
//! from that container, locally through [`Notification`] or remotely with
//! ordinary take requests over the router.

use crate::aspect::{AspectContext, AspectResult, ContainerAspect, InterceptionPoint};
use crate::error::{SpaceError, SpaceResult};
use crate::space::{OpOptions, Outcome, Space};
use coordspace_common::{AspectRef, ContainerRef, Entry, EntryId, Value};
use coordspace_proto::{Operation, Timeout};
use coordspace_query::Query;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Kind of the entries written into notification containers
pub const NOTIFICATION_KIND: &str = "notification";

/// One observed operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationEvent {
    pub operation: Operation,
    /// Name of the observed container
    pub container: String,
    /// Ids written or removed; empty for reads
    pub ids: Vec<EntryId>,
    /// Entries written, read or taken; empty for deletes
    pub entries: Vec<Entry>,
}

impl NotificationEvent {
    fn to_entry(&self) -> Entry {
        let ids = self
            .ids
            .iter()
            .map(|id| Value::Int(i64::try_from(id.as_u64()).unwrap_or(i64::MAX)))
            .collect::<Vec<_>>();
        let entries = self
            .entries
            .iter()
            .map(|e| Value::map([("kind", Value::from(e.kind.as_str())), ("value", e.value.clone())]))
            .collect::<Vec<_>>();
        Entry::new(
            NOTIFICATION_KIND,
            Value::map([
                ("operation", Value::from(self.operation.as_str())),
                ("container", Value::from(self.container.as_str())),
                ("ids", Value::from(ids)),
                ("entries", Value::from(entries)),
            ]),
        )
    }

    /// Decode an event entry; `None` for anything else
    #[must_use]
    pub fn from_entry(entry: &Entry) -> Option<Self> {
        if entry.kind != NOTIFICATION_KIND {
            return None;
        }
        let Value::Map(fields) = &entry.value else {
            return None;
        };
        let operation = match fields.get("operation")? {
            Value::Str(s) => Operation::parse(s)?,
            _ => return None,
        };
        let container = match fields.get("container")? {
            Value::Str(s) => s.clone(),
            _ => return None,
        };
        let ids = match fields.get("ids")? {
            Value::List(items) => items
                .iter()
                .map(|v| match v {
                    Value::Int(n) => u64::try_from(*n).ok().map(EntryId::new),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?,
            _ => return None,
        };
        let entries = match fields.get("entries")? {
            Value::List(items) => items.iter().map(decode_entry).collect::<Option<Vec<_>>>()?,
            _ => return None,
        };
        Some(Self {
            operation,
            container,
            ids,
            entries,
        })
    }
}

fn decode_entry(value: &Value) -> Option<Entry> {
    let Value::Map(fields) = value else {
        return None;
    };
    let kind = match fields.get("kind")? {
        Value::Str(s) => s.clone(),
        _ => return None,
    };
    Some(Entry::new(kind, fields.get("value").cloned().unwrap_or(Value::Null)))
}

/// Post-point aspect feeding a notification container
pub(crate) struct NotificationAspect {
    target: ContainerRef,
    operations: BTreeSet<Operation>,
}

impl NotificationAspect {
    pub(crate) fn new(target: ContainerRef, operations: &[Operation]) -> Self {
        let operations = if operations.is_empty() {
            Operation::ALL.into_iter().collect()
        } else {
            operations.iter().copied().collect()
        };
        Self { target, operations }
    }

    pub(crate) fn points(&self) -> Vec<InterceptionPoint> {
        self.operations
            .iter()
            .map(|op| match op {
                Operation::Read => InterceptionPoint::PostRead,
                Operation::Take => InterceptionPoint::PostTake,
                Operation::Delete => InterceptionPoint::PostDelete,
                Operation::Write => InterceptionPoint::PostWrite,
            })
            .collect()
    }

    fn publish(
        &self,
        ctx: &AspectContext<'_>,
        operation: Operation,
        ids: &[EntryId],
        entries: &[Entry],
    ) -> AspectResult {
        let event = NotificationEvent {
            operation,
            container: ctx.container().id().to_string(),
            ids: ids.to_vec(),
            entries: entries.to_vec(),
        };
        match ctx.write(&self.target, vec![event.to_entry()]) {
            Ok(_) => AspectResult::Ok,
            Err(SpaceError::ContainerNotFound(_)) => {
                debug!("Notification container {} is gone", self.target);
                AspectResult::Ok
            }
            Err(e) => AspectResult::NotOk(format!("notification not recorded: {e}")),
        }
    }
}

impl ContainerAspect for NotificationAspect {
    fn name(&self) -> &str {
        "notification"
    }

    fn post_write(&self, ctx: &AspectContext<'_>, ids: &[EntryId], entries: &[Entry]) -> AspectResult {
        self.publish(ctx, Operation::Write, ids, entries)
    }

    fn post_read(&self, ctx: &AspectContext<'_>, entries: &[Entry]) -> AspectResult {
        self.publish(ctx, Operation::Read, &[], entries)
    }

    fn post_take(&self, ctx: &AspectContext<'_>, entries: &[Entry]) -> AspectResult {
        self.publish(ctx, Operation::Take, &[], entries)
    }

    fn post_delete(&self, ctx: &AspectContext<'_>, ids: &[EntryId]) -> AspectResult {
        self.publish(ctx, Operation::Delete, ids, &[])
    }
}

/// Local listener of a notification
pub struct Notification {
    space: Arc<Space>,
    container: ContainerRef,
    aspect: AspectRef,
}

impl Notification {
    /// Observe `operations` on `container`; an empty list observes all of
    /// them
    pub fn create(space: &Arc<Space>, container: &ContainerRef, operations: &[Operation]) -> SpaceResult<Self> {
        let (target, aspect) = space.create_notification(container, operations)?;
        Ok(Self {
            space: Arc::clone(space),
            container: target,
            aspect,
        })
    }

    /// Container the events are written to
    #[must_use]
    pub const fn container(&self) -> &ContainerRef {
        &self.container
    }

    #[must_use]
    pub const fn aspect(&self) -> &AspectRef {
        &self.aspect
    }

    /// Wait for the next event
    pub async fn next(&self) -> SpaceResult<NotificationEvent> {
        loop {
            if let Some(event) = self.take(Timeout::Infinite).await? {
                return Ok(event);
            }
        }
    }

    /// The next event if one is already there
    pub async fn try_next(&self) -> SpaceResult<Option<NotificationEvent>> {
        self.take(Timeout::TryOnce).await
    }

    async fn take(&self, timeout: Timeout) -> SpaceResult<Option<NotificationEvent>> {
        let query = Query::all().with_limit(1);
        let options = OpOptions::default().with_timeout(timeout);
        let Outcome::Done(entries) = self.space.take(&self.container, &query, options).await? else {
            return Ok(None);
        };
        let event = entries.first().and_then(NotificationEvent::from_entry);
        if event.is_none() {
            warn!("Dropped a foreign entry from notification container {}", self.container);
        }
        Ok(event)
    }

    /// Stop observing and drop pending events
    pub fn close(self) -> SpaceResult<()> {
        match self.space.remove_aspect(&self.aspect) {
            // dropped already, with the observed container
            Ok(()) | Err(SpaceError::AspectNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.space.destroy_container(&self.container)
    }
}
