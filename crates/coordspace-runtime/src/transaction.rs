//! Transaction records
//!
//! A transaction remembers which entries it wrote and which it took, per
//! container, so commit and rollback touch only those slots.

use coordspace_common::{EntryId, TxId};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle state of a transaction
///
/// Committed and rolled back transactions are forgotten; an aborted or
/// rejected one is kept until its owner rolls it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    /// Its durable commit is running; no new work is accepted
    Committing,
    /// Rolled back to resolve a deadlock
    Aborted,
    /// Rolled back because an aspect refused the result of one of its
    /// operations
    Rejected,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Committing => "committing",
            Self::Aborted => "aborted",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Work log of one transaction
#[derive(Debug)]
pub struct Transaction {
    id: TxId,
    status: TxStatus,
    /// Created by the space for a single operation
    implicit: bool,
    written: Vec<(String, EntryId)>,
    taken: Vec<(String, EntryId)>,
}

impl Transaction {
    #[must_use]
    pub const fn new(id: TxId, implicit: bool) -> Self {
        Self {
            id,
            status: TxStatus::Active,
            implicit,
            written: Vec::new(),
            taken: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TxId {
        self.id
    }

    #[must_use]
    pub const fn status(&self) -> TxStatus {
        self.status
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, TxStatus::Active)
    }

    #[must_use]
    pub const fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn set_status(&mut self, status: TxStatus) {
        self.status = status;
    }

    pub fn record_write(&mut self, container: &str, id: EntryId) {
        self.written.push((container.to_string(), id));
    }

    pub fn record_take(&mut self, container: &str, id: EntryId) {
        self.taken.push((container.to_string(), id));
    }

    /// Forget a write that the same transaction took back
    pub fn forget_write(&mut self, container: &str, id: EntryId) {
        self.written.retain(|(c, e)| !(c == container && *e == id));
    }

    /// Drop every log record of a destroyed container
    pub fn forget_container(&mut self, container: &str) {
        self.written.retain(|(c, _)| c != container);
        self.taken.retain(|(c, _)| c != container);
    }

    #[must_use]
    pub fn written(&self) -> &[(String, EntryId)] {
        &self.written
    }

    #[must_use]
    pub fn taken(&self) -> &[(String, EntryId)] {
        &self.taken
    }

    /// Containers this transaction has touched
    #[must_use]
    pub fn containers(&self) -> BTreeSet<String> {
        self.written
            .iter()
            .chain(&self.taken)
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// Take the work log, leaving it empty
    pub fn drain(&mut self) -> (Vec<(String, EntryId)>, Vec<(String, EntryId)>) {
        (std::mem::take(&mut self.written), std::mem::take(&mut self.taken))
    }
}
