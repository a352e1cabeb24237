//! # hivemap-notify
//!
//! Hierarchical change notification for a file-backed keyspace.
//!
//! Clients open a [`KeyHandle`] and watch it for changes, optionally in the
//! whole subtree and optionally linked to a second key in another file. A
//! watch completes in one of three ways:
//!
//! - **sync**: a [`SyncWaiter`] blocks until something happens
//! - **callback**: a routine runs on the [`AsyncDelivery`] host
//! - **work item**: an in-process job is posted to the host
//!
//! ```text
//! report_change(key) ─► per-file subscription lists (depth sorted)
//!                          └─ subscription ─► queue of requests (FIFO)
//!                                               └─ driver ◄──► linked
//! ```
//!
//! A change nobody is waiting for is remembered, and the next watch on that
//! handle returns [`WatchOutcome::Triggered`] at once. Closing a handle or
//! deleting its key delivers [`DeliveryStatus::Cleanup`];
//! [`NotifyHub::rundown`] cancels whatever a thread still has queued.
//!
//! All bookkeeping happens under a single notify lock. Key-object references
//! dropped inside it are collected into [`DeferredReleases`] and released
//! after the lock is gone.

mod delivery;
mod dispatcher;
mod error;
mod filter;
mod hub;
mod keyspace;
mod release;
mod request;
mod security;
mod subscription;
pub mod testing;

pub use delivery::{AsyncDelivery, CallbackJob, WorkItemJob, WorkerDelivery};
pub use error::{NotifyError, Result};
pub use filter::{ChangeFilter, DeliveryStatus};
pub use hub::{KeyHandle, NotifyHub, SyncWaiter, WatchOutcome, WatchSpec};
pub use keyspace::{HiveId, KeyId, KeyTree, Keyspace};
pub use release::DeferredReleases;
pub use request::{CallbackRoutine, NotifyEvent, WaitResult, WorkItemRoutine};
pub use security::{AccessChecker, AllowAll, Principal};
