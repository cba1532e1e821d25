//! The space engine
//!
//! One [`Space`] owns every container and transaction behind a single store
//! lock that is only held for short, synchronous sections. A read, take or
//! delete that finds nothing available registers a waiter with its own
//! [`Notify`], records wait-for edges to the transactions locking matching
//! entries, and sleeps outside the lock until something it cares about
//! changes, its timeout elapses or it is cancelled.
//!
//! Operations without a transaction run in an implicit one that commits as
//! soon as the operation and its post aspects succeed. A commit marks the
//! transaction as committing, runs the durable write without the store lock
//! and then publishes the transaction's work.

use crate::aspect::{AspectContext, AspectManager, AspectResult, ContainerAspect, InterceptionPoint, Verdict};
use crate::container::{Container, TakeEffect, table_name};
use crate::deadlock::{DeadlockDetector, WaitId, victim_policy};
use crate::error::{SpaceError, SpaceResult};
use crate::notification::NotificationAspect;
use crate::transaction::{Transaction, TxStatus};
use coordspace_common::config::QueryConfig;
use coordspace_common::{
    AspectRef, ContainerRef, Entry, EntryId, RequestRef, SpaceConfig, SpaceUri, TransactionRef, TxId,
};
use coordspace_persistence::{CachePolicy, PersistenceManager, StoredMap, open_backend};
use coordspace_proto::{Codec, Operation, Timeout};
use coordspace_query::{IndexSpec, PropertyValueCache, Query};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of an operation that may find nothing
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Done(T),
    /// Nothing matched before the timeout, or the request was cancelled
    NotAvailable,
}

impl<T> Outcome<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Self::Done(v) => Outcome::Done(f(v)),
            Self::NotAvailable => Outcome::NotAvailable,
        }
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// Options of a read, take or delete
#[derive(Clone, Debug, Default)]
pub struct OpOptions {
    /// Run inside this transaction instead of an implicit one
    pub tx: Option<TransactionRef>,
    pub timeout: Timeout,
    /// Key under which the operation can be cancelled while it waits
    pub request: Option<RequestRef>,
}

impl OpOptions {
    #[must_use]
    pub fn with_tx(mut self, tx: &TransactionRef) -> Self {
        self.tx = Some(tx.clone());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_request(mut self, request: RequestRef) -> Self {
        self.request = Some(request);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Selector {
    Read,
    Take,
    Delete,
}

impl Selector {
    const fn pre_point(self) -> InterceptionPoint {
        match self {
            Self::Read => InterceptionPoint::PreRead,
            Self::Take => InterceptionPoint::PreTake,
            Self::Delete => InterceptionPoint::PreDelete,
        }
    }

    const fn post_point(self) -> InterceptionPoint {
        match self {
            Self::Read => InterceptionPoint::PostRead,
            Self::Take => InterceptionPoint::PostTake,
            Self::Delete => InterceptionPoint::PostDelete,
        }
    }

    fn pre(self, aspect: &dyn ContainerAspect, ctx: &AspectContext<'_>, query: &mut Query) -> AspectResult {
        match self {
            Self::Read => aspect.pre_read(ctx, query),
            Self::Take => aspect.pre_take(ctx, query),
            Self::Delete => aspect.pre_delete(ctx, query),
        }
    }

    fn post(self, aspect: &dyn ContainerAspect, ctx: &AspectContext<'_>, found: &Found) -> AspectResult {
        match self {
            Self::Read => aspect.post_read(ctx, &found.entries),
            Self::Take => aspect.post_take(ctx, &found.entries),
            Self::Delete => aspect.post_delete(ctx, &found.ids),
        }
    }
}

/// Entries selected by one read, take or delete
struct Found {
    ids: Vec<EntryId>,
    /// Copies handed to the caller; empty for deletes
    entries: Vec<Entry>,
}

enum Attempt {
    Done(Found),
    Blocked(BTreeSet<TxId>),
}

struct Waiter {
    tx: TxId,
    container: String,
    notify: Arc<Notify>,
    cancelled: bool,
}

struct SpaceState {
    containers: HashMap<String, Container>,
    transactions: HashMap<TxId, Transaction>,
    waiters: HashMap<WaitId, Waiter>,
    requests: HashMap<RequestRef, WaitId>,
    codec: Codec,
}

impl SpaceState {
    /// Wake waiters on any of `containers`, or belonging to `tx`
    fn wake(&self, containers: &BTreeSet<String>, tx: Option<TxId>) {
        for waiter in self.waiters.values() {
            if containers.contains(&waiter.container) || Some(waiter.tx) == tx {
                waiter.notify.notify_one();
            }
        }
    }
}

/// A coordination space
pub struct Space {
    uri: SpaceUri,
    persistence: Arc<PersistenceManager>,
    cache_policy: CachePolicy,
    query: QueryConfig,
    state: Mutex<SpaceState>,
    detector: DeadlockDetector,
    aspects: AspectManager,
    next_tx: AtomicU64,
    next_wait: AtomicU64,
    next_notification: AtomicU64,
}

impl Space {
    /// Create a space over an existing persistence manager
    pub fn new(config: &SpaceConfig, persistence: Arc<PersistenceManager>) -> SpaceResult<Arc<Self>> {
        let uri = config.space_uri()?;
        let cache_policy = CachePolicy::resolve(&config.cache);
        info!(
            "Space '{}' at {} (victim policy {:?})",
            config.space.name, uri, config.deadlock.victim
        );
        Ok(Arc::new(Self {
            aspects: AspectManager::new(uri.clone()),
            uri,
            persistence,
            cache_policy,
            query: config.query.clone(),
            state: Mutex::new(SpaceState {
                containers: HashMap::new(),
                transactions: HashMap::new(),
                waiters: HashMap::new(),
                requests: HashMap::new(),
                codec: Codec::new(),
            }),
            detector: DeadlockDetector::new(victim_policy(config.deadlock.victim)),
            next_tx: AtomicU64::new(1),
            next_wait: AtomicU64::new(1),
            next_notification: AtomicU64::new(1),
        }))
    }

    /// Open the configured backend and create a space over it
    pub fn open(config: &SpaceConfig) -> SpaceResult<Arc<Self>> {
        let backend = open_backend(&config.persistence)?;
        let persistence = PersistenceManager::new(backend, config.persistence.commit);
        Self::new(config, persistence)
    }

    #[must_use]
    pub const fn uri(&self) -> &SpaceUri {
        &self.uri
    }

    #[must_use]
    pub const fn detector(&self) -> &DeadlockDetector {
        &self.detector
    }

    #[must_use]
    pub const fn aspects(&self) -> &AspectManager {
        &self.aspects
    }

    /// Periodically break deadlocks and expire cached property values
    ///
    /// The task ends once the space is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let space: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(space) = space.upgrade() else {
                    break;
                };
                space.resolve_deadlocks();
                let evicted = space.evict_expired_properties();
                if evicted > 0 {
                    debug!("Evicted {} idle property cache slots", evicted);
                }
            }
        })
    }

    // ---- containers ----

    pub fn create_container(
        &self,
        name: &str,
        persistent: bool,
        indexes: &[IndexSpec],
    ) -> SpaceResult<ContainerRef> {
        let mut state = self.state.lock();
        if state.containers.contains_key(name) {
            return Err(SpaceError::ContainerExists(name.to_string()));
        }

        let reference = ContainerRef::new(name, self.uri.clone());
        let store = if persistent {
            let adapter = self.persistence.adapter(table_name(name));
            Some(StoredMap::open(adapter, self.cache_policy)?)
        } else {
            None
        };
        let properties = PropertyValueCache::new(self.query.entry_ttl(), self.query.property_ttl());
        let container = Container::open(reference.clone(), properties, store, indexes)?;
        info!(
            "Created {} container '{}' with {} index(es)",
            if persistent { "persistent" } else { "transient" },
            name,
            indexes.len()
        );
        state.containers.insert(name.to_string(), container);
        Ok(reference)
    }

    pub fn lookup_container(&self, name: &str) -> SpaceResult<ContainerRef> {
        self.state
            .lock()
            .containers
            .get(name)
            .map(|c| c.reference().clone())
            .ok_or_else(|| SpaceError::ContainerNotFound(name.to_string()))
    }

    /// Remove a container and its durable state
    ///
    /// Waiters on the container wake up and fail with `ContainerNotFound`.
    /// The container's aspects are dropped with it.
    pub fn destroy_container(&self, container: &ContainerRef) -> SpaceResult<()> {
        let name = self.container_name(container)?;
        self.lookup_container(name)?;
        let ctx = AspectContext::new(self, container, None);
        let pre = self.aspects.invoke(name, InterceptionPoint::PreDestroyContainer, |a| {
            a.pre_destroy_container(&ctx)
        })?;
        if pre == Verdict::Skip {
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            let removed = state
                .containers
                .remove(name)
                .ok_or_else(|| SpaceError::ContainerNotFound(name.to_string()))?;
            for tx in state.transactions.values_mut() {
                tx.forget_container(name);
            }
            state.wake(&BTreeSet::from([name.to_string()]), None);
            removed.destroy()?;
        }
        info!("Destroyed container '{}'", name);

        if let Err(e) = self.aspects.invoke(name, InterceptionPoint::PostDestroyContainer, |a| {
            a.post_destroy_container(&ctx)
        }) {
            warn!("Post-destroy aspect of container '{}' failed: {}", name, e);
        }
        let dropped = self.aspects.remove_container(name);
        if dropped > 0 {
            debug!("Dropped {} aspect(s) of container '{}'", dropped, name);
        }
        Ok(())
    }

    /// Remove every entry of a container
    ///
    /// Fails with a retryable lock conflict while any transaction has
    /// uncommitted work on the container.
    pub fn clear_container(&self, container: &ContainerRef) -> SpaceResult<usize> {
        let name = self.container_name(container)?;
        let mut state = self.state.lock();
        let target = state
            .containers
            .get_mut(name)
            .ok_or_else(|| SpaceError::ContainerNotFound(name.to_string()))?;
        match target.clear() {
            Ok(n) => Ok(n),
            Err(e) => {
                warn!("Clear of container '{}' refused: {}", name, e);
                Err(e.into())
            }
        }
    }

    /// Number of live entries, locked ones included
    pub fn container_len(&self, container: &ContainerRef) -> SpaceResult<usize> {
        let name = self.container_name(container)?;
        self.state
            .lock()
            .containers
            .get(name)
            .map(Container::len)
            .ok_or_else(|| SpaceError::ContainerNotFound(name.to_string()))
    }

    fn container_name<'a>(&self, container: &'a ContainerRef) -> SpaceResult<&'a str> {
        if container.space() != &self.uri {
            return Err(SpaceError::ContainerNotFound(container.to_string()));
        }
        Ok(container.id())
    }

    // ---- aspects and notifications ----

    /// Register an aspect on a container, or on every container
    pub fn add_aspect<I>(
        &self,
        container: Option<&ContainerRef>,
        points: I,
        aspect: Arc<dyn ContainerAspect>,
    ) -> SpaceResult<AspectRef>
    where
        I: IntoIterator<Item = InterceptionPoint>,
    {
        let name = match container {
            Some(container) => {
                let name = self.container_name(container)?;
                self.lookup_container(name)?;
                Some(name)
            }
            None => None,
        };
        Ok(self.aspects.add(name, points, aspect))
    }

    pub fn remove_aspect(&self, aspect: &AspectRef) -> SpaceResult<()> {
        if aspect.space() == &self.uri && self.aspects.remove(aspect) {
            debug!("Removed aspect {}", aspect);
            Ok(())
        } else {
            Err(SpaceError::AspectNotFound(aspect.to_string()))
        }
    }

    /// Observe operations on a container
    ///
    /// Returns the transient container the events are written to and the
    /// aspect producing them. An empty `operations` list observes every
    /// operation.
    pub fn create_notification(
        &self,
        container: &ContainerRef,
        operations: &[Operation],
    ) -> SpaceResult<(ContainerRef, AspectRef)> {
        let name = self.container_name(container)?;
        self.lookup_container(name)?;
        let target = loop {
            let n = self.next_notification.fetch_add(1, Ordering::Relaxed);
            match self.create_container(&format!("notify:{n}"), false, &[]) {
                Err(SpaceError::ContainerExists(_)) => {}
                other => break other?,
            }
        };
        let aspect = NotificationAspect::new(target.clone(), operations);
        let reference = self.aspects.add(Some(name), aspect.points(), Arc::new(aspect));
        info!("Notification {} on '{}' feeds '{}'", reference, name, target.id());
        Ok((target, reference))
    }

    // ---- transactions ----

    pub fn begin_transaction(&self) -> TransactionRef {
        let id = self.start_tx(&mut self.state.lock(), false);
        debug!("Began transaction {}", id);
        TransactionRef::for_tx(id, self.uri.clone())
    }

    /// Make every write and take of the transaction visible at once
    pub fn commit(&self, tx: &TransactionRef) -> SpaceResult<()> {
        let id = self.tx_id(tx)?;
        if !self.state.lock().transactions.contains_key(&id) {
            return Err(SpaceError::TransactionNotFound(tx.to_string()));
        }
        let result = self.commit_tx(id);
        self.detector.graph().remove_transaction(id);
        result
    }

    /// Discard the transaction's work
    ///
    /// Rolling back a transaction aborted by deadlock resolution or rejected
    /// by an aspect just forgets it.
    pub fn rollback(&self, tx: &TransactionRef) -> SpaceResult<()> {
        let id = self.tx_id(tx)?;
        let mut state = self.state.lock();
        match state.transactions.get(&id).map(Transaction::status) {
            None => return Err(SpaceError::TransactionNotFound(tx.to_string())),
            Some(TxStatus::Committing) => {
                return Err(SpaceError::TransactionNotActive {
                    tx: id,
                    status: TxStatus::Committing,
                });
            }
            Some(_) => self.rollback_locked(&mut state, id),
        }
        drop(state);
        self.detector.graph().remove_transaction(id);
        debug!("Rolled back transaction {}", id);
        Ok(())
    }

    #[must_use]
    pub fn transaction_status(&self, tx: &TransactionRef) -> Option<TxStatus> {
        let id = self.tx_id(tx).ok()?;
        self.state.lock().transactions.get(&id).map(Transaction::status)
    }

    fn start_tx(&self, state: &mut SpaceState, implicit: bool) -> TxId {
        let id = TxId::new(self.next_tx.fetch_add(1, Ordering::Relaxed));
        state.transactions.insert(id, Transaction::new(id, implicit));
        id
    }

    fn tx_id(&self, tx: &TransactionRef) -> SpaceResult<TxId> {
        if tx.space() != &self.uri {
            return Err(SpaceError::TransactionNotFound(tx.to_string()));
        }
        tx.tx_id()
            .ok_or_else(|| SpaceError::TransactionNotFound(tx.to_string()))
    }

    /// Id of an active transaction
    fn resolve_tx(&self, state: &SpaceState, tx: &TransactionRef) -> SpaceResult<TxId> {
        let id = self.tx_id(tx)?;
        match state.transactions.get(&id).map(Transaction::status) {
            Some(TxStatus::Active) => Ok(id),
            Some(status) => Err(SpaceError::TransactionNotActive { tx: id, status }),
            None => Err(SpaceError::TransactionNotFound(tx.to_string())),
        }
    }

    /// Transaction an operation runs in; `None` starts an implicit one
    fn enter(&self, tx: Option<&TransactionRef>) -> SpaceResult<TxScope<'_>> {
        let mut state = self.state.lock();
        let (tx, implicit) = match tx {
            Some(tx) => (self.resolve_tx(&state, tx)?, false),
            None => (self.start_tx(&mut state, true), true),
        };
        Ok(TxScope {
            space: self,
            tx,
            implicit,
            finished: false,
        })
    }

    /// Commit in two steps
    ///
    /// The transaction is marked committing under the store lock, its
    /// pending log is applied without the lock, and its work is published
    /// (or undone when the durable write failed) under the lock again.
    fn commit_tx(&self, id: TxId) -> SpaceResult<()> {
        let durable = {
            let mut state = self.state.lock();
            let record = state
                .transactions
                .get_mut(&id)
                .ok_or_else(|| SpaceError::TransactionNotFound(id.to_string()))?;
            if !record.is_active() {
                return Err(SpaceError::TransactionNotActive {
                    tx: id,
                    status: record.status(),
                });
            }
            record.set_status(TxStatus::Committing);
            self.persistence.is_open(id)
        };

        let applied = if durable {
            self.persistence.commit(id)
        } else {
            Ok(())
        };

        let mut state = self.state.lock();
        let Some(mut record) = state.transactions.remove(&id) else {
            return Err(SpaceError::TransactionNotFound(id.to_string()));
        };
        let (written, taken) = record.drain();
        if let Err(e) = applied {
            warn!("Durable commit of transaction {} failed: {}", id, e);
            self.undo(&mut state, id, written, taken);
            return Err(e.into());
        }

        let mut touched = BTreeSet::new();
        for (name, entry) in &written {
            if let Some(container) = state.containers.get_mut(name) {
                container.commit_write(*entry, id);
            }
            touched.insert(name.clone());
        }
        for (name, entry) in &taken {
            if let Some(container) = state.containers.get_mut(name) {
                container.commit_take(*entry, id);
            }
            touched.insert(name.clone());
        }
        state.wake(&touched, None);
        debug!(
            "Committed transaction {} ({} written, {} taken)",
            id,
            written.len(),
            taken.len()
        );
        Ok(())
    }

    fn rollback_locked(&self, state: &mut SpaceState, id: TxId) {
        if let Some(mut record) = state.transactions.remove(&id) {
            let (written, taken) = record.drain();
            self.undo(state, id, written, taken);
        }
    }

    /// Undo a transaction's work in memory and drop its pending durable log
    fn undo(
        &self,
        state: &mut SpaceState,
        id: TxId,
        written: Vec<(String, EntryId)>,
        taken: Vec<(String, EntryId)>,
    ) {
        self.persistence.rollback(id);
        let mut touched = BTreeSet::new();
        for (name, entry) in written {
            if let Some(container) = state.containers.get_mut(&name) {
                container.rollback_write(entry, id);
            }
            touched.insert(name);
        }
        for (name, entry) in taken {
            if let Some(container) = state.containers.get_mut(&name) {
                container.rollback_take(entry, id);
            }
            touched.insert(name);
        }
        state.wake(&touched, Some(id));
    }

    /// Roll back an active transaction, keeping its record as `status`
    fn abort(&self, victim: TxId, status: TxStatus) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.transactions.get_mut(&victim) else {
            return false;
        };
        if !record.is_active() {
            return false;
        }
        record.set_status(status);
        let (written, taken) = record.drain();
        self.undo(&mut state, victim, written, taken);
        drop(state);
        self.detector.graph().remove_transaction(victim);
        true
    }

    /// Run deadlock detection and abort one victim per cycle
    pub fn resolve_deadlocks(&self) -> usize {
        self.detector
            .detect()
            .into_iter()
            .filter(|deadlock| self.abort(deadlock.victim, TxStatus::Aborted))
            .count()
    }

    pub fn evict_expired_properties(&self) -> usize {
        self.state
            .lock()
            .containers
            .values()
            .map(Container::evict_expired_properties)
            .sum()
    }

    // ---- entries ----

    /// Write entries; without a transaction they are committed at once
    pub fn write(
        &self,
        container: &ContainerRef,
        mut entries: Vec<Entry>,
        tx: Option<&TransactionRef>,
    ) -> SpaceResult<Vec<EntryId>> {
        let name = self.container_name(container)?;
        let scope = self.enter(tx)?;
        let ctx = AspectContext::new(self, container, Some(scope.tx));
        let pre = self
            .aspects
            .invoke(name, InterceptionPoint::PreWrite, |a| a.pre_write(&ctx, &mut entries))?;
        if pre == Verdict::Skip {
            return scope.finish(Vec::new());
        }

        let copies = self
            .aspects
            .intercepts(name, InterceptionPoint::PostWrite)
            .then(|| entries.clone());
        let ids = self.write_in(container, entries, scope.tx)?;
        if let Some(copies) = copies {
            let post = self
                .aspects
                .invoke(name, InterceptionPoint::PostWrite, |a| a.post_write(&ctx, &ids, &copies));
            scope.check(post)?;
        }
        scope.finish(ids)
    }

    /// Write under an already resolved transaction, without aspects
    pub(crate) fn write_in(
        &self,
        container: &ContainerRef,
        entries: Vec<Entry>,
        tx: TxId,
    ) -> SpaceResult<Vec<EntryId>> {
        let name = self.container_name(container)?;
        let mut state = self.state.lock();
        let result = self.write_locked(&mut state, name, entries, tx);
        // other transactions re-check which locks they wait on
        state.wake(&BTreeSet::from([name.to_string()]), None);
        result
    }

    fn write_locked(
        &self,
        state: &mut SpaceState,
        name: &str,
        entries: Vec<Entry>,
        id: TxId,
    ) -> SpaceResult<Vec<EntryId>> {
        let SpaceState {
            containers,
            transactions,
            ..
        } = &mut *state;
        let record = transactions
            .get_mut(&id)
            .ok_or_else(|| SpaceError::TransactionNotFound(id.to_string()))?;
        if !record.is_active() {
            return Err(SpaceError::TransactionNotActive {
                tx: id,
                status: record.status(),
            });
        }
        let container = containers
            .get_mut(name)
            .ok_or_else(|| SpaceError::ContainerNotFound(name.to_string()))?;
        if container.is_persistent() {
            self.persistence.begin(id);
        }

        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry_id = container.insert(entry, id)?;
            record.record_write(name, entry_id);
            ids.push(entry_id);
        }
        Ok(ids)
    }

    /// Copies of matching entries; the entries stay in the container
    pub async fn read(
        &self,
        container: &ContainerRef,
        query: &Query,
        options: OpOptions,
    ) -> SpaceResult<Outcome<Vec<Entry>>> {
        let outcome = self.select(container, query, options, Selector::Read).await?;
        Ok(outcome.map(|found| found.entries))
    }

    /// Remove matching entries and return copies of them
    pub async fn take(
        &self,
        container: &ContainerRef,
        query: &Query,
        options: OpOptions,
    ) -> SpaceResult<Outcome<Vec<Entry>>> {
        let outcome = self.select(container, query, options, Selector::Take).await?;
        Ok(outcome.map(|found| found.entries))
    }

    /// Remove matching entries and return how many were removed
    pub async fn delete(
        &self,
        container: &ContainerRef,
        query: &Query,
        options: OpOptions,
    ) -> SpaceResult<Outcome<usize>> {
        let outcome = self.select(container, query, options, Selector::Delete).await?;
        Ok(outcome.map(|found| found.ids.len()))
    }

    /// Cancel a waiting operation; it completes with `NotAvailable`
    ///
    /// Returns `false` when no operation is waiting under that reference.
    pub fn cancel(&self, request: &RequestRef) -> bool {
        let mut state = self.state.lock();
        let Some(wait) = state.requests.get(request).copied() else {
            return false;
        };
        match state.waiters.get_mut(&wait) {
            Some(waiter) => {
                waiter.cancelled = true;
                waiter.notify.notify_one();
                debug!("Cancelled request {}", request);
                true
            }
            None => false,
        }
    }

    /// Number of operations currently waiting
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    async fn select(
        &self,
        container: &ContainerRef,
        query: &Query,
        options: OpOptions,
        selector: Selector,
    ) -> SpaceResult<Outcome<Found>> {
        let name = self.container_name(container)?;
        let deadline = options.timeout.as_duration().map(|d| Instant::now() + d);
        let scope = self.enter(options.tx.as_ref())?;
        let ctx = AspectContext::new(self, container, Some(scope.tx));

        let mut query = query.clone();
        let pre = self
            .aspects
            .invoke(name, selector.pre_point(), |a| selector.pre(a, &ctx, &mut query))?;
        if pre == Verdict::Skip {
            return Ok(Outcome::NotAvailable);
        }

        let wait = WaitGuard {
            space: self,
            wait: WaitId(self.next_wait.fetch_add(1, Ordering::Relaxed)),
            request: options.request,
        };
        let Outcome::Done(found) = self
            .wait_for(&wait, name, &query, selector, scope.tx, deadline)
            .await?
        else {
            return Ok(Outcome::NotAvailable);
        };
        drop(wait);

        let post = self
            .aspects
            .invoke(name, selector.post_point(), |a| selector.post(a, &ctx, &found));
        scope.check(post)?;
        scope.finish(Outcome::Done(found))
    }

    async fn wait_for(
        &self,
        guard: &WaitGuard<'_>,
        name: &str,
        query: &Query,
        selector: Selector,
        tx: TxId,
        deadline: Option<Instant>,
    ) -> SpaceResult<Outcome<Found>> {
        let notify = Arc::new(Notify::new());
        loop {
            let holders = {
                let mut state = self.state.lock();
                if state.waiters.get(&guard.wait).is_some_and(|w| w.cancelled) {
                    return Ok(Outcome::NotAvailable);
                }
                match self.attempt(&mut state, name, query, selector, tx)? {
                    Attempt::Done(found) => return Ok(Outcome::Done(found)),
                    Attempt::Blocked(holders) => {
                        if deadline.is_some_and(|d| Instant::now() >= d) {
                            return Ok(Outcome::NotAvailable);
                        }
                        state.waiters.entry(guard.wait).or_insert_with(|| Waiter {
                            tx,
                            container: name.to_string(),
                            notify: Arc::clone(&notify),
                            cancelled: false,
                        });
                        if let Some(request) = &guard.request {
                            state.requests.insert(request.clone(), guard.wait);
                        }
                        holders
                    }
                }
            };

            if self.detector.graph().set_waits(guard.wait, tx, holders) {
                self.resolve_deadlocks();
            }

            match deadline {
                Some(deadline) => {
                    // a final attempt follows the timeout
                    let _ = tokio::time::timeout_at(deadline, notify.notified()).await;
                }
                None => notify.notified().await,
            }
        }
    }

    fn attempt(
        &self,
        state: &mut SpaceState,
        name: &str,
        query: &Query,
        selector: Selector,
        tx: TxId,
    ) -> SpaceResult<Attempt> {
        match state.transactions.get(&tx).map(Transaction::status) {
            Some(TxStatus::Active) => {}
            Some(TxStatus::Aborted) => return Err(SpaceError::DeadlockVictim(tx)),
            Some(status) => return Err(SpaceError::TransactionNotActive { tx, status }),
            None => return Err(SpaceError::TransactionNotFound(tx.to_string())),
        }

        let SpaceState {
            containers,
            transactions,
            codec,
            ..
        } = &mut *state;
        let container = containers
            .get_mut(name)
            .ok_or_else(|| SpaceError::ContainerNotFound(name.to_string()))?;
        let selection = container.select(query, tx)?;
        if selection.matches.is_empty() {
            return Ok(Attempt::Blocked(selection.holders));
        }

        let mut entries = Vec::new();
        if selector != Selector::Delete {
            entries.reserve(selection.matches.len());
            for id in &selection.matches {
                if let Some(entry) = container.entry(*id)? {
                    entries.push(codec.copy(&*entry)?);
                }
            }
        }

        if selector != Selector::Read {
            if container.is_persistent() {
                self.persistence.begin(tx);
            }
            let record = transactions
                .get_mut(&tx)
                .ok_or_else(|| SpaceError::TransactionNotFound(tx.to_string()))?;
            for id in &selection.matches {
                match container.take(*id, tx)? {
                    Some(TakeEffect::Pending) => record.record_take(name, *id),
                    Some(TakeEffect::Discarded) => record.forget_write(name, *id),
                    None => {}
                }
            }
        }

        Ok(Attempt::Done(Found {
            ids: selection.matches,
            entries,
        }))
    }

    /// Release durable resources of every container
    pub fn close(&self) {
        let state = self.state.lock();
        for container in state.containers.values() {
            container.close();
        }
        info!("Space {} closed", self.uri);
    }
}

/// Transaction of one operation
///
/// An implicit transaction is committed by [`TxScope::finish`] and rolled
/// back when the scope is dropped without finishing.
struct TxScope<'a> {
    space: &'a Space,
    tx: TxId,
    implicit: bool,
    finished: bool,
}

impl TxScope<'_> {
    /// Pass on a post-point verdict
    ///
    /// A refusal rolls back the transaction; an explicit one is kept as
    /// rejected until its owner rolls it back.
    fn check(&self, post: SpaceResult<Verdict>) -> SpaceResult<()> {
        match post {
            Ok(_) => Ok(()),
            Err(e) => {
                if !self.implicit && self.space.abort(self.tx, TxStatus::Rejected) {
                    warn!("Transaction {} rolled back: {}", self.tx, e);
                }
                Err(e)
            }
        }
    }

    fn finish<T>(mut self, value: T) -> SpaceResult<T> {
        if self.implicit {
            let committed = self.space.commit_tx(self.tx);
            self.finished = committed.is_ok();
            committed?;
        }
        Ok(value)
    }
}

impl Drop for TxScope<'_> {
    fn drop(&mut self) {
        if !self.implicit {
            return;
        }
        if !self.finished {
            let mut state = self.space.state.lock();
            self.space.rollback_locked(&mut state, self.tx);
        }
        self.space.detector.graph().remove_transaction(self.tx);
    }
}

/// Cleans up after a read, take or delete wait however it ends
struct WaitGuard<'a> {
    space: &'a Space,
    wait: WaitId,
    request: Option<RequestRef>,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.space.state.lock();
        state.waiters.remove(&self.wait);
        if let Some(request) = &self.request
            && state.requests.get(request) == Some(&self.wait)
        {
            state.requests.remove(request);
        }
        drop(state);
        self.space.detector.graph().remove_op(self.wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Notification;
    use coordspace_common::Value;
    use coordspace_common::config::{CommitMode, PersistenceProfile, VictimPolicyConfig};
    use coordspace_persistence::{
        Backend, MemoryBackend, PersistenceError, PersistenceResult, WriteOp,
    };
    use coordspace_query::{CompareOp, IndexedKinds, Matchmaker, parse_query};
    use std::sync::atomic::AtomicBool;

    fn space() -> Arc<Space> {
        Space::open(&SpaceConfig::default()).unwrap()
    }

    fn ticket(price: i64) -> Entry {
        Entry::new("ticket", Value::map([("price", Value::from(price))]))
    }

    fn prices(entries: &[Entry]) -> Vec<i64> {
        entries
            .iter()
            .filter_map(|e| match e.property(&["price"]) {
                Some(Value::Int(p)) => Some(*p),
                _ => None,
            })
            .collect()
    }

    fn done<T: std::fmt::Debug>(outcome: Outcome<T>) -> T {
        match outcome {
            Outcome::Done(v) => v,
            Outcome::NotAvailable => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn test_write_read_take() {
        let space = space();
        let orders = space
            .create_container("orders", false, &[IndexSpec::extended("price", IndexedKinds::All)])
            .unwrap();
        space
            .write(&orders, vec![ticket(5), ticket(50), ticket(7)], None)
            .unwrap();

        let cheap = parse_query("price < 10").unwrap();
        let read = done(space.read(&orders, &cheap, OpOptions::default()).await.unwrap());
        assert_eq!(prices(&read), vec![5, 7]);
        assert_eq!(space.container_len(&orders).unwrap(), 3);

        let taken = done(
            space
                .take(&orders, &cheap.clone().with_limit(1), OpOptions::default())
                .await
                .unwrap(),
        );
        assert_eq!(prices(&taken), vec![5]);
        assert_eq!(space.container_len(&orders).unwrap(), 2);

        let deleted = done(space.delete(&orders, &Query::all(), OpOptions::default()).await.unwrap());
        assert_eq!(deleted, 2);
        assert_eq!(
            space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap(),
            Outcome::NotAvailable
        );
    }

    #[tokio::test]
    async fn test_container_lifecycle_errors() {
        let space = space();
        let orders = space.create_container("orders", false, &[]).unwrap();
        assert!(matches!(
            space.create_container("orders", false, &[]),
            Err(SpaceError::ContainerExists(_))
        ));
        assert_eq!(space.lookup_container("orders").unwrap(), orders);

        space.destroy_container(&orders).unwrap();
        assert!(matches!(
            space.lookup_container("orders"),
            Err(SpaceError::ContainerNotFound(_))
        ));
        assert!(matches!(
            space.write(&orders, vec![ticket(1)], None),
            Err(SpaceError::ContainerNotFound(_))
        ));

        let foreign = ContainerRef::new("orders", SpaceUri::parse("mem://elsewhere").unwrap());
        assert!(matches!(
            space.container_len(&foreign),
            Err(SpaceError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_uncommitted_write_isolated() {
        let space = space();
        let orders = space.create_container("orders", false, &[]).unwrap();
        let tx = space.begin_transaction();
        space.write(&orders, vec![ticket(5)], Some(&tx)).unwrap();

        let own = space
            .read(&orders, &Query::all(), OpOptions::default().with_tx(&tx))
            .await
            .unwrap();
        assert_eq!(prices(&done(own)), vec![5]);
        assert_eq!(
            space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap(),
            Outcome::NotAvailable
        );

        space.commit(&tx).unwrap();
        assert!(space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap().is_done());
        assert!(matches!(space.commit(&tx), Err(SpaceError::TransactionNotFound(_))));
    }

    #[tokio::test]
    async fn test_commit_exposes_write_and_take_together() {
        let space = space();
        let orders = space.create_container("orders", false, &[]).unwrap();
        space.write(&orders, vec![ticket(1)], None).unwrap();

        let tx = space.begin_transaction();
        space.write(&orders, vec![ticket(2)], Some(&tx)).unwrap();
        let taken = space
            .take(&orders, &Query::new(Matchmaker::eq("price", 1)), OpOptions::default().with_tx(&tx))
            .await
            .unwrap();
        assert_eq!(prices(&done(taken)), vec![1]);

        // neither effect is visible before commit
        assert_eq!(
            space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap(),
            Outcome::NotAvailable
        );

        space.commit(&tx).unwrap();
        let after = done(space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap());
        assert_eq!(prices(&after), vec![2]);
    }

    #[tokio::test]
    async fn test_rollback_restores_taken_entries() {
        let space = space();
        let orders = space.create_container("orders", false, &[]).unwrap();
        space.write(&orders, vec![ticket(1)], None).unwrap();

        let tx = space.begin_transaction();
        space
            .take(&orders, &Query::all(), OpOptions::default().with_tx(&tx))
            .await
            .unwrap();
        space.write(&orders, vec![ticket(9)], Some(&tx)).unwrap();
        space.rollback(&tx).unwrap();

        let after = done(space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap());
        assert_eq!(prices(&after), vec![1]);
        assert_eq!(space.transaction_status(&tx), None);
    }

    #[tokio::test]
    async fn test_blocking_take_woken_by_write() {
        let space = space();
        let orders = space.create_container("orders", false, &[]).unwrap();

        let waiter = {
            let space = Arc::clone(&space);
            let orders = orders.clone();
            tokio::spawn(async move {
                let query = Query::new(Matchmaker::compare("price", CompareOp::Ge, 100));
                space
                    .take(&orders, &query, OpOptions::default().with_timeout(Timeout::Infinite))
                    .await
            })
        };

        while space.waiting() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        space.write(&orders, vec![ticket(3)], None).unwrap();
        space.write(&orders, vec![ticket(150)], None).unwrap();

        let taken = done(waiter.await.unwrap().unwrap());
        assert_eq!(prices(&taken), vec![150]);
        assert_eq!(space.waiting(), 0);
        assert_eq!(space.container_len(&orders).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_not_available() {
        let space = space();
        let orders = space.create_container("orders", false, &[]).unwrap();
        let outcome = space
            .take(
                &orders,
                &Query::all(),
                OpOptions::default().with_timeout(Timeout::Millis(30)),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NotAvailable);
        assert_eq!(space.waiting(), 0);
        assert_eq!(space.detector().graph().edge_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_waiting_request() {
        let space = space();
        let orders = space.create_container("orders", false, &[]).unwrap();
        let request = RequestRef::new("req-1", space.uri().clone());
        assert!(!space.cancel(&request));

        let waiter = {
            let space = Arc::clone(&space);
            let orders = orders.clone();
            let request = request.clone();
            tokio::spawn(async move {
                space
                    .read(
                        &orders,
                        &Query::all(),
                        OpOptions::default()
                            .with_timeout(Timeout::Infinite)
                            .with_request(request),
                    )
                    .await
            })
        };

        while !space.cancel(&request) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(waiter.await.unwrap().unwrap(), Outcome::NotAvailable);
        assert_eq!(space.waiting(), 0);
    }

    #[tokio::test]
    async fn test_deadlock_has_exactly_one_victim() {
        let space = space();
        let left = space.create_container("left", false, &[]).unwrap();
        let right = space.create_container("right", false, &[]).unwrap();

        let t1 = space.begin_transaction();
        let t2 = space.begin_transaction();
        space.write(&left, vec![ticket(1)], Some(&t1)).unwrap();
        space.write(&right, vec![ticket(2)], Some(&t2)).unwrap();

        let first = {
            let space = Arc::clone(&space);
            let right = right.clone();
            let t1 = t1.clone();
            tokio::spawn(async move {
                space
                    .take(
                        &right,
                        &Query::all(),
                        OpOptions::default()
                            .with_tx(&t1)
                            .with_timeout(Timeout::Infinite),
                    )
                    .await
            })
        };
        while space.detector().graph().edge_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // t2 closes the cycle and, being younger, is aborted
        let second = space
            .take(
                &left,
                &Query::all(),
                OpOptions::default()
                    .with_tx(&t2)
                    .with_timeout(Timeout::Infinite),
            )
            .await;
        assert!(matches!(second, Err(SpaceError::DeadlockVictim(_))));
        assert_eq!(space.transaction_status(&t2), Some(TxStatus::Aborted));
        assert!(matches!(
            space.write(&left, vec![ticket(3)], Some(&t2)),
            Err(SpaceError::TransactionNotActive { .. })
        ));

        // t1 survives and gets the next committed entry
        space.write(&right, vec![ticket(4)], None).unwrap();
        let taken = done(first.await.unwrap().unwrap());
        assert_eq!(prices(&taken), vec![4]);
        space.commit(&t1).unwrap();
        space.rollback(&t2).unwrap();
        assert_eq!(space.detector().graph().edge_count(), 0);
    }

    #[tokio::test]
    async fn test_oldest_victim_policy() {
        let mut config = SpaceConfig::default();
        config.deadlock.victim = VictimPolicyConfig::Oldest;
        let space = Space::open(&config).unwrap();
        let left = space.create_container("left", false, &[]).unwrap();
        let right = space.create_container("right", false, &[]).unwrap();

        let t1 = space.begin_transaction();
        let t2 = space.begin_transaction();
        space.write(&left, vec![ticket(1)], Some(&t1)).unwrap();
        space.write(&right, vec![ticket(2)], Some(&t2)).unwrap();

        let first = {
            let space = Arc::clone(&space);
            let right = right.clone();
            let t1 = t1.clone();
            tokio::spawn(async move {
                space
                    .take(
                        &right,
                        &Query::all(),
                        OpOptions::default()
                            .with_tx(&t1)
                            .with_timeout(Timeout::Infinite),
                    )
                    .await
            })
        };
        while space.detector().graph().edge_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // t1 is aborted; its write to `left` is undone, so t2 has nothing
        // to take there until the timeout
        let second = space
            .take(
                &left,
                &Query::all(),
                OpOptions::default()
                    .with_tx(&t2)
                    .with_timeout(Timeout::Millis(50)),
            )
            .await
            .unwrap();
        assert_eq!(second, Outcome::NotAvailable);
        assert!(matches!(
            first.await.unwrap(),
            Err(SpaceError::DeadlockVictim(_))
        ));
        space.commit(&t2).unwrap();
    }

    #[tokio::test]
    async fn test_clear_conflicts_with_open_write() {
        let space = space();
        let orders = space.create_container("orders", true, &[]).unwrap();
        space.write(&orders, vec![ticket(1)], None).unwrap();

        let tx = space.begin_transaction();
        space.write(&orders, vec![ticket(2)], Some(&tx)).unwrap();
        let err = space.clear_container(&orders).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(space.container_len(&orders).unwrap(), 2);

        space.commit(&tx).unwrap();
        assert_eq!(space.clear_container(&orders).unwrap(), 2);
        assert_eq!(space.container_len(&orders).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persistent_container_recovered_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SpaceConfig::default();
        config.persistence.profile = PersistenceProfile::Redb;
        config.persistence.path = Some(dir.path().join("space.redb"));
        let indexes = [IndexSpec::basic("price", IndexedKinds::All)];

        {
            let space = Space::open(&config).unwrap();
            let orders = space.create_container("orders", true, &indexes).unwrap();
            space
                .write(&orders, vec![ticket(1), ticket(2), ticket(3)], None)
                .unwrap();
            space
                .take(&orders, &Query::new(Matchmaker::eq("price", 2)), OpOptions::default())
                .await
                .unwrap();

            let tx = space.begin_transaction();
            space.write(&orders, vec![ticket(99)], Some(&tx)).unwrap();
            // never committed
            space.close();
        }

        let space = Space::open(&config).unwrap();
        let orders = space.create_container("orders", true, &indexes).unwrap();
        let all = done(space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap());
        assert_eq!(prices(&all), vec![1, 3]);

        let hit = space
            .read(&orders, &Query::new(Matchmaker::eq("price", 3)), OpOptions::default())
            .await
            .unwrap();
        assert_eq!(prices(&done(hit)), vec![3]);
    }

    /// Memory backend whose commits can be made to fail or to wait
    #[derive(Default)]
    struct TestBackend {
        inner: MemoryBackend,
        fail: AtomicBool,
        entered: AtomicBool,
        gate: Mutex<()>,
    }

    impl Backend for TestBackend {
        fn name(&self) -> &'static str {
            "test"
        }

        fn create_table(&self, table: &str) -> PersistenceResult<()> {
            self.inner.create_table(table)
        }

        fn drop_table(&self, table: &str) -> PersistenceResult<bool> {
            self.inner.drop_table(table)
        }

        fn table_exists(&self, table: &str) -> PersistenceResult<bool> {
            self.inner.table_exists(table)
        }

        fn get(&self, table: &str, key: &[u8]) -> PersistenceResult<Option<Vec<u8>>> {
            self.inner.get(table, key)
        }

        fn scan(&self, table: &str) -> PersistenceResult<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan(table)
        }

        fn keys(&self, table: &str) -> PersistenceResult<Vec<Vec<u8>>> {
            self.inner.keys(table)
        }

        fn count(&self, table: &str) -> PersistenceResult<u64> {
            self.inner.count(table)
        }

        fn clear(&self, table: &str) -> PersistenceResult<()> {
            self.inner.clear(table)
        }

        fn apply(&self, batch: &[WriteOp], mode: CommitMode) -> PersistenceResult<()> {
            self.entered.store(true, Ordering::SeqCst);
            let _open = self.gate.lock();
            if self.fail.load(Ordering::SeqCst) {
                return Err(PersistenceError::Io(std::io::Error::other("disk full")));
            }
            self.inner.apply(batch, mode)
        }
    }

    fn space_over(backend: Arc<TestBackend>) -> Arc<Space> {
        let persistence = PersistenceManager::new(backend, CommitMode::Sync);
        Space::new(&SpaceConfig::default(), persistence).unwrap()
    }

    #[tokio::test]
    async fn test_failed_durable_commit_restores_container() {
        let backend = Arc::new(TestBackend::default());
        let space = space_over(Arc::clone(&backend));
        let orders = space
            .create_container("orders", true, &[IndexSpec::basic("price", IndexedKinds::All)])
            .unwrap();
        space.write(&orders, vec![ticket(1)], None).unwrap();

        let tx = space.begin_transaction();
        let taken = space
            .take(&orders, &Query::all(), OpOptions::default().with_tx(&tx))
            .await
            .unwrap();
        assert_eq!(prices(&done(taken)), vec![1]);
        space.write(&orders, vec![ticket(2)], Some(&tx)).unwrap();
        assert_eq!(space.container_len(&orders).unwrap(), 2);

        // a reader waits on the entry the transaction took
        let reader = {
            let space = Arc::clone(&space);
            let orders = orders.clone();
            tokio::spawn(async move {
                let query = Query::new(Matchmaker::eq("price", 1));
                space
                    .read(&orders, &query, OpOptions::default().with_timeout(Timeout::Millis(5_000)))
                    .await
            })
        };
        while space.detector().graph().edge_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        backend.fail.store(true, Ordering::SeqCst);
        let err = space.commit(&tx).unwrap_err();
        assert!(matches!(err, SpaceError::Persistence(PersistenceError::Io(_))));
        backend.fail.store(false, Ordering::SeqCst);

        assert_eq!(space.transaction_status(&tx), None);
        assert_eq!(space.container_len(&orders).unwrap(), 1);
        assert_eq!(prices(&done(reader.await.unwrap().unwrap())), vec![1]);
        assert_eq!(space.detector().graph().edge_count(), 0);

        let after = done(space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap());
        assert_eq!(prices(&after), vec![1]);
        let indexed = space
            .read(&orders, &Query::new(Matchmaker::eq("price", 2)), OpOptions::default())
            .await
            .unwrap();
        assert_eq!(indexed, Outcome::NotAvailable);
    }

    #[tokio::test]
    async fn test_durable_commit_runs_without_store_lock() {
        let backend = Arc::new(TestBackend::default());
        let space = space_over(Arc::clone(&backend));
        let orders = space.create_container("orders", true, &[]).unwrap();
        let scratch = space.create_container("scratch", false, &[]).unwrap();
        let tx = space.begin_transaction();
        space.write(&orders, vec![ticket(1)], Some(&tx)).unwrap();

        let gate = backend.gate.lock();
        let committing = {
            let space = Arc::clone(&space);
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || space.commit(&tx))
        };
        while !backend.entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(space.transaction_status(&tx), Some(TxStatus::Committing));
        space.write(&scratch, vec![ticket(2)], None).unwrap();
        assert_eq!(space.container_len(&scratch).unwrap(), 1);
        assert!(matches!(
            space.write(&orders, vec![ticket(3)], Some(&tx)),
            Err(SpaceError::TransactionNotActive {
                status: TxStatus::Committing,
                ..
            })
        ));
        assert!(matches!(
            space.rollback(&tx),
            Err(SpaceError::TransactionNotActive { .. })
        ));
        assert_eq!(
            space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap(),
            Outcome::NotAvailable
        );

        drop(gate);
        committing.await.unwrap().unwrap();
        let after = done(space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap());
        assert_eq!(prices(&after), vec![1]);
        assert_eq!(space.transaction_status(&tx), None);
    }

    async fn redb_reads(dir: &std::path::Path, commit: CommitMode) -> Vec<Vec<i64>> {
        let mut config = SpaceConfig::default();
        config.persistence.profile = PersistenceProfile::Redb;
        config.persistence.path = Some(dir.join(format!("{commit:?}.redb")));
        config.persistence.commit = commit;
        let space = Space::open(&config).unwrap();
        let orders = space
            .create_container("orders", true, &[IndexSpec::extended("price", IndexedKinds::All)])
            .unwrap();

        space
            .write(&orders, vec![ticket(1), ticket(2), ticket(3)], None)
            .unwrap();
        space
            .take(&orders, &Query::new(Matchmaker::eq("price", 2)), OpOptions::default())
            .await
            .unwrap();
        let tx = space.begin_transaction();
        space.write(&orders, vec![ticket(4)], Some(&tx)).unwrap();
        space.commit(&tx).unwrap();

        let mut reads = Vec::new();
        for query in ["", "price > 1", "price = 3"] {
            let query = parse_query(query).unwrap();
            let found = space.read(&orders, &query, OpOptions::default()).await.unwrap();
            reads.push(prices(&done(found)));
        }
        space.close();
        reads
    }

    #[tokio::test]
    async fn test_async_commit_reads_match_sync() {
        let dir = tempfile::tempdir().unwrap();
        let sync = redb_reads(dir.path(), CommitMode::Sync).await;
        let eventual = redb_reads(dir.path(), CommitMode::Async).await;
        assert_eq!(sync, eventual);
        assert_eq!(sync, vec![vec![1, 3, 4], vec![3, 4], vec![3]]);
    }

    /// Caps prices on write and takes one entry at a time
    struct PriceCap(i64);

    impl ContainerAspect for PriceCap {
        fn name(&self) -> &str {
            "price-cap"
        }

        fn pre_write(&self, _ctx: &AspectContext<'_>, entries: &mut Vec<Entry>) -> AspectResult {
            let too_high = entries
                .iter()
                .any(|e| matches!(e.property(&["price"]), Some(Value::Int(p)) if *p > self.0));
            if too_high {
                AspectResult::NotOk("price too high".to_string())
            } else {
                AspectResult::Ok
            }
        }

        fn pre_take(&self, _ctx: &AspectContext<'_>, query: &mut Query) -> AspectResult {
            query.limit = Some(1);
            AspectResult::Ok
        }

        fn pre_read(&self, _ctx: &AspectContext<'_>, _query: &mut Query) -> AspectResult {
            AspectResult::Skip
        }
    }

    #[tokio::test]
    async fn test_pre_aspects_refuse_and_rewrite() {
        let space = space();
        let orders = space.create_container("orders", false, &[]).unwrap();
        let cap = space
            .add_aspect(
                Some(&orders),
                [
                    InterceptionPoint::PreWrite,
                    InterceptionPoint::PreTake,
                    InterceptionPoint::PreRead,
                ],
                Arc::new(PriceCap(100)),
            )
            .unwrap();

        space.write(&orders, vec![ticket(5), ticket(6)], None).unwrap();
        let refused = space.write(&orders, vec![ticket(7), ticket(500)], None);
        assert!(matches!(refused, Err(SpaceError::AspectRejected(msg)) if msg.contains("price too high")));
        assert_eq!(space.container_len(&orders).unwrap(), 2);

        let read = space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap();
        assert_eq!(read, Outcome::NotAvailable);
        let taken = done(space.take(&orders, &Query::all(), OpOptions::default()).await.unwrap());
        assert_eq!(prices(&taken), vec![5]);

        space.remove_aspect(&cap).unwrap();
        assert!(matches!(
            space.remove_aspect(&cap),
            Err(SpaceError::AspectNotFound(_))
        ));
        let rest = done(space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap());
        assert_eq!(prices(&rest), vec![6]);
    }

    struct RefuseTakes;

    impl ContainerAspect for RefuseTakes {
        fn post_take(&self, _ctx: &AspectContext<'_>, _entries: &[Entry]) -> AspectResult {
            AspectResult::NotOk("audit closed".to_string())
        }
    }

    #[tokio::test]
    async fn test_post_aspect_refusal_rolls_back() {
        let space = space();
        let orders = space.create_container("orders", true, &[]).unwrap();
        space.write(&orders, vec![ticket(1)], None).unwrap();
        space
            .add_aspect(None, [InterceptionPoint::PostTake], Arc::new(RefuseTakes))
            .unwrap();

        // implicit: the take is undone
        let err = space
            .take(&orders, &Query::all(), OpOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), coordspace_proto::ErrorKind::AspectRejected);
        assert_eq!(space.container_len(&orders).unwrap(), 1);

        // explicit: the whole transaction is rolled back and kept as rejected
        let tx = space.begin_transaction();
        space.write(&orders, vec![ticket(2)], Some(&tx)).unwrap();
        assert!(
            space
                .take(&orders, &Query::new(Matchmaker::eq("price", 1)), OpOptions::default().with_tx(&tx))
                .await
                .is_err()
        );
        assert_eq!(space.transaction_status(&tx), Some(TxStatus::Rejected));
        assert!(matches!(
            space.commit(&tx),
            Err(SpaceError::TransactionNotActive {
                status: TxStatus::Rejected,
                ..
            })
        ));
        assert_eq!(space.container_len(&orders).unwrap(), 1);
        let left = done(space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap());
        assert_eq!(prices(&left), vec![1]);

        space.rollback(&tx).unwrap();
        assert_eq!(space.transaction_status(&tx), None);
    }

    #[tokio::test]
    async fn test_notifications_follow_commits() {
        let space = space();
        let orders = space.create_container("orders", false, &[]).unwrap();
        let listener =
            Notification::create(&space, &orders, &[Operation::Write, Operation::Take]).unwrap();

        let tx = space.begin_transaction();
        let ids = space.write(&orders, vec![ticket(1)], Some(&tx)).unwrap();
        assert_eq!(listener.try_next().await.unwrap(), None);
        space.commit(&tx).unwrap();

        let written = listener.next().await.unwrap();
        assert_eq!(written.operation, Operation::Write);
        assert_eq!(written.container, "orders");
        assert_eq!(written.ids, ids);
        assert_eq!(written.entries, vec![ticket(1)]);

        // reads are not observed
        space.read(&orders, &Query::all(), OpOptions::default()).await.unwrap();
        assert_eq!(listener.try_next().await.unwrap(), None);

        space.take(&orders, &Query::all(), OpOptions::default()).await.unwrap();
        let taken = listener.next().await.unwrap();
        assert_eq!(taken.operation, Operation::Take);
        assert_eq!(taken.entries, vec![ticket(1)]);

        space.destroy_container(&orders).unwrap();
        assert!(space.aspects().is_empty());
        let target = listener.container().clone();
        listener.close().unwrap();
        assert!(matches!(
            space.container_len(&target),
            Err(SpaceError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_waiting_listener_wakes_on_write() {
        let space = space();
        let orders = space.create_container("orders", false, &[]).unwrap();
        let listener = Notification::create(&space, &orders, &[]).unwrap();

        let next = tokio::spawn(async move { listener.next().await });
        while space.waiting() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        space.write(&orders, vec![ticket(7)], None).unwrap();
        let event = next.await.unwrap().unwrap();
        assert_eq!(event.entries, vec![ticket(7)]);
    }
}
