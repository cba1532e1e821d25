//! Coordspace Runtime - the transactional space engine
//!
//! - [`Space`]: containers, transactions and blocking read/take/delete
//! - [`DeadlockDetector`]: wait-for graph and cycle resolution
//! - [`SpaceRequestHandler`]: executes protocol requests against a space
//! - [`ContainerAspect`]: interceptors around entry operations
//! - [`Notification`]: events about operations on a container

pub mod aspect;
pub mod container;
pub mod deadlock;
pub mod error;
pub mod handler;
pub mod notification;
pub mod space;
pub mod transaction;

pub use aspect::{
    AspectContext, AspectManager, AspectResult, ContainerAspect, InterceptionPoint, Verdict,
};
pub use container::{Container, Selection, TakeEffect};
pub use deadlock::{
    Deadlock, DeadlockDetector, OldestVictim, VictimPolicy, WaitForGraph, WaitId, WaitSnapshot,
    YoungestVictim, victim_policy,
};
pub use error::{SpaceError, SpaceResult};
pub use handler::{SpaceRequestHandler, execute};
pub use notification::{NOTIFICATION_KIND, Notification, NotificationEvent};
pub use space::{OpOptions, Outcome, Space};
pub use transaction::{Transaction, TxStatus};
