//! Delivery requests and the completion primitives they signal.

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use hivemap_slab::{Key, NodeKey};
use parking_lot::{Condvar, Mutex};

use crate::filter::DeliveryStatus;
use crate::hub::KeyObject;
use crate::subscription::SubId;

pub(crate) type ReqId = Key<Request>;

/// Client routine run by a callback delivery.
pub type CallbackRoutine = Arc<dyn Fn(DeliveryStatus) + Send + Sync>;

/// Work run on the delivery host for a work-item delivery.
pub type WorkItemRoutine = Arc<dyn Fn(DeliveryStatus) + Send + Sync>;

/// Signalable event carrying the status it was signalled with.
#[derive(Debug, Default)]
pub struct NotifyEvent {
    status: Mutex<Option<DeliveryStatus>>,
    cond: Condvar,
}

impl NotifyEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self, status: DeliveryStatus) {
        *self.status.lock() = Some(status);
        self.cond.notify_all();
    }

    pub fn status(&self) -> Option<DeliveryStatus> {
        *self.status.lock()
    }

    pub fn is_signaled(&self) -> bool {
        self.status().is_some()
    }

    /// Waits until signalled; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DeliveryStatus> {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while status.is_none() {
            if self.cond.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        *status
    }

    pub fn reset(&self) {
        *self.status.lock() = None;
    }
}

/// How a synchronous wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Delivered(DeliveryStatus),
    /// The request was cancelled before anything was delivered.
    Removed,
    TimedOut,
}

/// Storage a synchronous waiter sleeps on. Owned by the waiter; the
/// dispatcher only fills it in.
#[derive(Debug, Default)]
pub(crate) struct SyncSlot {
    result: Mutex<Option<WaitResult>>,
    cond: Condvar,
}

impl SyncSlot {
    /// First completion wins.
    pub fn complete(&self, result: WaitResult) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.cond.notify_all();
        }
    }

    pub fn result(&self) -> Option<WaitResult> {
        *self.result.lock()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let mut slot = self.result.lock();
        match timeout {
            None => {
                while slot.is_none() {
                    self.cond.wait(&mut slot);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while slot.is_none() {
                    if self.cond.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        slot.unwrap_or(WaitResult::TimedOut)
    }
}

/// Where a delivery goes. Shared by every member of a linked group.
#[derive(Clone)]
pub(crate) enum Target {
    Sync(Arc<SyncSlot>),
    Callback {
        routine: CallbackRoutine,
        event: Option<Arc<NotifyEvent>>,
    },
    WorkItem {
        item: WorkItemRoutine,
        event: Option<Arc<NotifyEvent>>,
    },
}

impl Target {
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Sync(_) => "sync",
            Target::Callback { .. } => "callback",
            Target::WorkItem { .. } => "work-item",
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Position in a linked group. The driver is the one member cancellation is
/// run from; delivering a linked member makes it the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Driver { linked: Option<ReqId> },
    Linked { driver: ReqId },
}

/// Who is responsible for freeing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Custody {
    /// On a subscription queue; delivery or rundown frees it.
    Queued,
    /// Handed to the delivery host; the callback job frees it.
    Posted,
    /// Delivered to a synchronous waiter, who frees it after waking.
    Waiter,
}

pub(crate) struct Request {
    pub target: Target,
    pub role: Role,
    pub custody: Custody,
    pub owner: ThreadId,
    /// Reference on the watched key object; always released through
    /// `DeferredReleases`.
    pub object: Option<Arc<KeyObject>>,
    pub queued_on: Option<(SubId, NodeKey<ReqId>)>,
    pub owner_node: Option<NodeKey<ReqId>>,
}

impl Request {
    /// The other member of this request's group, if any.
    pub fn partner(&self) -> Option<ReqId> {
        match self.role {
            Role::Driver { linked } => linked,
            Role::Linked { driver } => Some(driver),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("target", &self.target)
            .field("role", &self.role)
            .field("custody", &self.custody)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_slot_first_completion_wins() {
        let slot = SyncSlot::default();
        slot.complete(WaitResult::Delivered(DeliveryStatus::Changed));
        slot.complete(WaitResult::Removed);
        assert_eq!(
            slot.wait(Some(Duration::from_millis(1))),
            WaitResult::Delivered(DeliveryStatus::Changed)
        );
    }

    #[test]
    fn test_sync_slot_times_out() {
        let slot = SyncSlot::default();
        assert_eq!(slot.wait(Some(Duration::from_millis(5))), WaitResult::TimedOut);
        assert_eq!(slot.result(), None);
    }

    #[test]
    fn test_event_wakes_waiter() {
        let event = NotifyEvent::new();
        let signaller = event.clone();
        let t = std::thread::spawn(move || signaller.signal(DeliveryStatus::Cleanup));
        assert_eq!(
            event.wait_timeout(Duration::from_secs(5)),
            Some(DeliveryStatus::Cleanup)
        );
        t.join().unwrap();
        event.reset();
        assert!(!event.is_signaled());
    }
}
