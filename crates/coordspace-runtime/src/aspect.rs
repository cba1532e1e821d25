//! Aspects
//!
//! An aspect intercepts entry operations before and after they run. It is
//! registered for a set of [`InterceptionPoint`]s, either on one container
//! or on the whole space. At every point the container's aspects run first,
//! then the space's, each group in registration order; the first result that
//! is not [`AspectResult::Ok`] ends the chain.
//!
//! A pre point can rewrite the operation (the entries to write, the query to
//! match), skip it, or refuse it. A post point sees the result; refusing
//! there rolls back the transaction the operation ran in.
//!
//! Aspects run outside the space's state lock, so they may call back into
//! the space.

use crate::error::{SpaceError, SpaceResult};
use crate::space::Space;
use coordspace_common::{AspectRef, ContainerRef, Entry, EntryId, SpaceUri, TxId};
use coordspace_query::Query;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Where an aspect is invoked
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InterceptionPoint {
    PreRead,
    PostRead,
    PreTake,
    PostTake,
    PreDelete,
    PostDelete,
    PreWrite,
    PostWrite,
    PreDestroyContainer,
    PostDestroyContainer,
}

/// Verdict of one aspect
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AspectResult {
    Ok,
    /// Pre point: the operation does nothing. Post point: the remaining
    /// aspects are not called.
    Skip,
    /// Refuse the operation
    NotOk(String),
}

/// Outcome of running an aspect chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Skip,
}

/// What an aspect sees of the intercepted operation
pub struct AspectContext<'a> {
    space: &'a Space,
    container: &'a ContainerRef,
    tx: Option<TxId>,
}

impl<'a> AspectContext<'a> {
    pub(crate) const fn new(space: &'a Space, container: &'a ContainerRef, tx: Option<TxId>) -> Self {
        Self {
            space,
            container,
            tx,
        }
    }

    #[must_use]
    pub const fn space(&self) -> &Space {
        self.space
    }

    /// Container the operation targets
    #[must_use]
    pub const fn container(&self) -> &ContainerRef {
        self.container
    }

    /// Transaction the operation runs in; container lifecycle points have
    /// none
    #[must_use]
    pub const fn tx(&self) -> Option<TxId> {
        self.tx
    }

    /// Write entries inside the intercepted operation's transaction
    ///
    /// These writes are not intercepted themselves. Without a transaction
    /// this is an ordinary auto-committed write.
    pub fn write(&self, container: &ContainerRef, entries: Vec<Entry>) -> SpaceResult<Vec<EntryId>> {
        match self.tx {
            Some(tx) => self.space.write_in(container, entries, tx),
            None => self.space.write(container, entries, None),
        }
    }
}

/// Interceptor of container operations
///
/// Every hook defaults to [`AspectResult::Ok`]; an aspect overrides the ones
/// for the points it is registered at.
#[allow(unused_variables)]
pub trait ContainerAspect: Send + Sync {
    /// Name used in logs and rejection messages
    fn name(&self) -> &str {
        "aspect"
    }

    fn pre_write(&self, ctx: &AspectContext<'_>, entries: &mut Vec<Entry>) -> AspectResult {
        AspectResult::Ok
    }

    fn post_write(&self, ctx: &AspectContext<'_>, ids: &[EntryId], entries: &[Entry]) -> AspectResult {
        AspectResult::Ok
    }

    fn pre_read(&self, ctx: &AspectContext<'_>, query: &mut Query) -> AspectResult {
        AspectResult::Ok
    }

    fn post_read(&self, ctx: &AspectContext<'_>, entries: &[Entry]) -> AspectResult {
        AspectResult::Ok
    }

    fn pre_take(&self, ctx: &AspectContext<'_>, query: &mut Query) -> AspectResult {
        AspectResult::Ok
    }

    fn post_take(&self, ctx: &AspectContext<'_>, entries: &[Entry]) -> AspectResult {
        AspectResult::Ok
    }

    fn pre_delete(&self, ctx: &AspectContext<'_>, query: &mut Query) -> AspectResult {
        AspectResult::Ok
    }

    fn post_delete(&self, ctx: &AspectContext<'_>, ids: &[EntryId]) -> AspectResult {
        AspectResult::Ok
    }

    fn pre_destroy_container(&self, ctx: &AspectContext<'_>) -> AspectResult {
        AspectResult::Ok
    }

    fn post_destroy_container(&self, ctx: &AspectContext<'_>) -> AspectResult {
        AspectResult::Ok
    }
}

struct Registration {
    reference: AspectRef,
    /// `None` for a space aspect
    container: Option<String>,
    points: BTreeSet<InterceptionPoint>,
    aspect: Arc<dyn ContainerAspect>,
}

/// Registered aspects of one space
pub struct AspectManager {
    space: SpaceUri,
    next: AtomicU64,
    registrations: RwLock<Vec<Registration>>,
}

impl AspectManager {
    #[must_use]
    pub fn new(space: SpaceUri) -> Self {
        Self {
            space,
            next: AtomicU64::new(1),
            registrations: RwLock::new(Vec::new()),
        }
    }

    /// Register an aspect on a container, or on every container when
    /// `container` is `None`
    pub fn add<I>(&self, container: Option<&str>, points: I, aspect: Arc<dyn ContainerAspect>) -> AspectRef
    where
        I: IntoIterator<Item = InterceptionPoint>,
    {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let reference = AspectRef::new(format!("aspect-{n}"), self.space.clone());
        debug!(
            "Registered aspect '{}' as {} on {}",
            aspect.name(),
            reference,
            container.unwrap_or("the space")
        );
        self.registrations.write().push(Registration {
            reference: reference.clone(),
            container: container.map(str::to_string),
            points: points.into_iter().collect(),
            aspect,
        });
        reference
    }

    /// Returns whether the aspect was registered
    pub fn remove(&self, aspect: &AspectRef) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| &r.reference != aspect);
        registrations.len() != before
    }

    /// Drop every aspect of a destroyed container
    pub fn remove_container(&self, container: &str) -> usize {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.container.as_deref() != Some(container));
        before - registrations.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }

    /// Whether any aspect runs at this point for the container
    #[must_use]
    pub fn intercepts(&self, container: &str, point: InterceptionPoint) -> bool {
        self.registrations
            .read()
            .iter()
            .any(|r| r.points.contains(&point) && r.container.as_deref().is_none_or(|c| c == container))
    }

    /// Container aspects, then space aspects, registered at `point`
    fn chain(&self, container: &str, point: InterceptionPoint) -> Vec<Arc<dyn ContainerAspect>> {
        let registrations = self.registrations.read();
        let mut chain: Vec<Arc<dyn ContainerAspect>> = registrations
            .iter()
            .filter(|r| r.points.contains(&point) && r.container.as_deref() == Some(container))
            .map(|r| Arc::clone(&r.aspect))
            .collect();
        chain.extend(
            registrations
                .iter()
                .filter(|r| r.points.contains(&point) && r.container.is_none())
                .map(|r| Arc::clone(&r.aspect)),
        );
        chain
    }

    /// Run the chain for a point
    ///
    /// The registry lock is released before any aspect runs.
    pub fn invoke<F>(&self, container: &str, point: InterceptionPoint, mut hook: F) -> SpaceResult<Verdict>
    where
        F: FnMut(&dyn ContainerAspect) -> AspectResult,
    {
        for aspect in self.chain(container, point) {
            match hook(aspect.as_ref()) {
                AspectResult::Ok => {}
                AspectResult::Skip => {
                    debug!("Aspect '{}' skipped {:?} on '{}'", aspect.name(), point, container);
                    return Ok(Verdict::Skip);
                }
                AspectResult::NotOk(reason) => {
                    debug!(
                        "Aspect '{}' refused {:?} on '{}': {}",
                        aspect.name(),
                        point,
                        container,
                        reason
                    );
                    return Err(SpaceError::AspectRejected(format!("{}: {}", aspect.name(), reason)));
                }
            }
        }
        Ok(Verdict::Proceed)
    }
}
