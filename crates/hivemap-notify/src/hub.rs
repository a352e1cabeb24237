//! The notification hub: key handles, watches, change reports and rundown.

use std::cell::Cell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use hivemap_config::{log_notify_debug, log_notify_trace};
use parking_lot::{Mutex, MutexGuard};

use crate::delivery::AsyncDelivery;
use crate::dispatcher::{Dispatch, NotifyState, OwnerEnd};
use crate::error::{NotifyError, Result};
use crate::filter::{ChangeFilter, DeliveryStatus};
use crate::keyspace::{HiveId, KeyId, Keyspace};
use crate::release::DeferredReleases;
use crate::request::{
    CallbackRoutine, NotifyEvent, ReqId, Role, SyncSlot, Target, WaitResult, WorkItemRoutine,
};
use crate::security::{AccessChecker, Principal};
use crate::subscription::NewSubscription;

thread_local! {
    /// Address of the hub whose notify lock this thread holds, or 0.
    static HELD_HUB: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ObjectId(pub u64);

/// The object behind a [`KeyHandle`]. Requests hold extra references on it;
/// the last reference going away unregisters it from the hub.
pub(crate) struct KeyObject {
    id: ObjectId,
    key: KeyId,
    hive: HiveId,
    principal: Principal,
    closed: AtomicBool,
    hub: Weak<HubInner>,
}

impl Drop for KeyObject {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.object_released(self.id);
        }
    }
}

pub(crate) struct HubInner {
    keyspace: Arc<dyn Keyspace>,
    access: Arc<dyn AccessChecker>,
    delivery: Arc<dyn AsyncDelivery>,
    state: Mutex<NotifyState>,
    next_object: AtomicU64,
}

/// Notify lock guard. Marks the thread so that releasing a key object under
/// the lock is caught instead of deadlocking.
pub(crate) struct StateGuard<'a> {
    guard: MutexGuard<'a, NotifyState>,
}

impl Deref for StateGuard<'_> {
    type Target = NotifyState;

    fn deref(&self) -> &NotifyState {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut NotifyState {
        &mut self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        HELD_HUB.with(|held| held.set(0));
    }
}

impl HubInner {
    fn address(&self) -> usize {
        self as *const HubInner as usize
    }

    pub(crate) fn lock(&self) -> StateGuard<'_> {
        let guard = self.state.lock();
        HELD_HUB.with(|held| held.set(self.address()));
        StateGuard { guard }
    }

    fn object_released(&self, id: ObjectId) {
        let held = HELD_HUB.with(Cell::get);
        assert!(
            held != self.address(),
            "key object released while holding the notify lock"
        );
        self.lock().objects.remove(&id);
    }

    /// Completion of a posted callback. False when the request was cancelled
    /// after posting.
    pub(crate) fn finish_posted(&self, id: ReqId) -> bool {
        let mut releases = DeferredReleases::new();
        let live = self.lock().finish_posted(id, &mut releases);
        releases.drain();
        live
    }
}

/// What a watch call found when it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// A change was already pending; the delivery has been made.
    Triggered,
    /// The request is queued until the next change.
    Pending,
}

/// Parameters shared by every watch mode.
#[derive(Clone, Copy)]
pub struct WatchSpec<'a> {
    pub filter: ChangeFilter,
    pub watch_subtree: bool,
    /// Key in another file watched together with the primary.
    pub secondary: Option<&'a KeyHandle>,
}

impl<'a> WatchSpec<'a> {
    pub fn new(filter: ChangeFilter) -> Self {
        Self {
            filter,
            watch_subtree: false,
            secondary: None,
        }
    }

    pub fn subtree(mut self) -> Self {
        self.watch_subtree = true;
        self
    }

    pub fn with_secondary(mut self, secondary: &'a KeyHandle) -> Self {
        self.secondary = Some(secondary);
        self
    }
}

/// Hierarchical change notification over a keyspace.
#[derive(Clone)]
pub struct NotifyHub {
    inner: Arc<HubInner>,
}

impl NotifyHub {
    pub fn new(
        keyspace: Arc<dyn Keyspace>,
        access: Arc<dyn AccessChecker>,
        delivery: Arc<dyn AsyncDelivery>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                keyspace,
                access,
                delivery,
                state: Mutex::new(NotifyState::default()),
                next_object: AtomicU64::new(1),
            }),
        }
    }

    pub fn keyspace(&self) -> &Arc<dyn Keyspace> {
        &self.inner.keyspace
    }

    /// Opens a handle on `key` on behalf of `principal`.
    pub fn open_key(&self, key: KeyId, principal: Principal) -> Result<KeyHandle> {
        let keyspace = &self.inner.keyspace;
        if keyspace.is_deleted(key) {
            return Err(NotifyError::KeyDeleted(key));
        }
        let hive = keyspace.hive_of(key).ok_or(NotifyError::KeyDeleted(key))?;
        let id = ObjectId(self.inner.next_object.fetch_add(1, Ordering::Relaxed));
        let object = Arc::new(KeyObject {
            id,
            key,
            hive,
            principal,
            closed: AtomicBool::new(false),
            hub: Arc::downgrade(&self.inner),
        });
        self.inner.lock().objects.insert(id, key);
        Ok(KeyHandle {
            hub: self.clone(),
            object,
        })
    }

    /// Queues a synchronous watch. The returned waiter blocks until a
    /// change, a cleanup, or cancellation.
    pub fn watch_sync(&self, handle: &KeyHandle, spec: &WatchSpec<'_>) -> Result<SyncWaiter> {
        let slot = Arc::new(SyncSlot::default());
        let (outcome, requests) = self.watch(handle, spec, Target::Sync(slot.clone()))?;
        Ok(SyncWaiter {
            hub: self.clone(),
            slot,
            requests,
            outcome,
            finished: false,
        })
    }

    /// Queues a watch completed by running `routine` on the delivery host.
    /// `event`, if given, is signalled just before the routine runs, or
    /// alone when the watch is cancelled.
    pub fn watch_callback(
        &self,
        handle: &KeyHandle,
        spec: &WatchSpec<'_>,
        routine: CallbackRoutine,
        event: Option<Arc<NotifyEvent>>,
    ) -> Result<WatchOutcome> {
        let (outcome, _) = self.watch(handle, spec, Target::Callback { routine, event })?;
        Ok(outcome)
    }

    /// Queues an in-process watch completed by posting `item`. Work-item
    /// watches skip the access check and cannot be linked.
    pub fn watch_work_item(
        &self,
        handle: &KeyHandle,
        spec: &WatchSpec<'_>,
        item: WorkItemRoutine,
        event: Option<Arc<NotifyEvent>>,
    ) -> Result<WatchOutcome> {
        let (outcome, _) = self.watch(handle, spec, Target::WorkItem { item, event })?;
        Ok(outcome)
    }

    fn check_handle(&self, handle: &KeyHandle) -> Result<()> {
        if !Arc::ptr_eq(&handle.hub.inner, &self.inner) || handle.is_closed() {
            return Err(NotifyError::HandleClosed);
        }
        if self.inner.keyspace.is_deleted(handle.key()) {
            return Err(NotifyError::KeyDeleted(handle.key()));
        }
        Ok(())
    }

    fn new_subscription(
        &self,
        handle: &KeyHandle,
        filter: ChangeFilter,
        watch_subtree: bool,
    ) -> Result<NewSubscription> {
        let object = &handle.object;
        let depth = self
            .inner
            .keyspace
            .depth(object.key)
            .ok_or(NotifyError::KeyDeleted(object.key))?;
        Ok(NewSubscription {
            object: object.id,
            key: object.key,
            hive: object.hive,
            depth,
            watch_subtree,
            filter,
            principal: object.principal.clone(),
        })
    }

    fn watch(
        &self,
        handle: &KeyHandle,
        spec: &WatchSpec<'_>,
        target: Target,
    ) -> Result<(WatchOutcome, Vec<ReqId>)> {
        let bits = spec.filter.bits();
        let filter = ChangeFilter::validate(bits).ok_or(NotifyError::InvalidFilter(bits))?;
        self.check_handle(handle)?;
        if let Some(secondary) = spec.secondary {
            if matches!(target, Target::WorkItem { .. }) {
                return Err(NotifyError::LinkedWorkItem);
            }
            self.check_handle(secondary)?;
            if secondary.hive() == handle.hive() {
                return Err(NotifyError::SameFile(handle.hive()));
            }
        }

        let primary_sub = self.new_subscription(handle, filter, spec.watch_subtree)?;
        let secondary_sub = spec
            .secondary
            .map(|s| self.new_subscription(s, filter, spec.watch_subtree))
            .transpose()?;

        let owner = thread::current().id();
        let hub = Arc::downgrade(&self.inner);
        let ctx = Dispatch {
            host: self.inner.delivery.as_ref(),
            hub: &hub,
        };
        let mut releases = DeferredReleases::new();
        let result = {
            let mut state = self.inner.lock();
            // close may have raced with the checks above
            if handle.is_closed() || spec.secondary.is_some_and(KeyHandle::is_closed) {
                return Err(NotifyError::HandleClosed);
            }

            let sub = state.subs.add(primary_sub);
            let pending = state.subs.get(sub).is_some_and(|s| s.pending);
            let primary = state.enqueue(
                sub,
                target.clone(),
                Role::Driver { linked: None },
                owner,
                handle.object.clone(),
                OwnerEnd::Front,
            );

            match (spec.secondary, secondary_sub) {
                _ if pending => {
                    state.deliver(sub, DeliveryStatus::Changed, &ctx, &mut releases);
                    (WatchOutcome::Triggered, vec![primary])
                }
                (Some(secondary), Some(new)) => {
                    let sec_sub = state.subs.add(new);
                    let linked = state.enqueue(
                        sec_sub,
                        target,
                        Role::Linked { driver: primary },
                        owner,
                        secondary.object.clone(),
                        OwnerEnd::Back,
                    );
                    state.requests[primary].role = Role::Driver {
                        linked: Some(linked),
                    };
                    if state.subs.get(sec_sub).is_some_and(|s| s.pending) {
                        state.deliver(sec_sub, DeliveryStatus::Changed, &ctx, &mut releases);
                        (WatchOutcome::Triggered, vec![primary, linked])
                    } else {
                        (WatchOutcome::Pending, vec![primary, linked])
                    }
                }
                _ => (WatchOutcome::Pending, vec![primary]),
            }
        };
        releases.drain();
        log_notify_trace!(
            "Watch queued",
            key = tracing::field::display(handle.key()),
            outcome = tracing::field::debug(result.0)
        );
        Ok(result)
    }

    /// Reports `change` at `key`. A name change (subkey created or deleted)
    /// is reported on the parent. Changes are also reported to the root
    /// file's subscribers. Returns the number of requests dispatched.
    pub fn report_change(&self, key: KeyId, change: ChangeFilter) -> usize {
        let keyspace = self.inner.keyspace.as_ref();
        let changed = if change == ChangeFilter::NAME {
            keyspace.parent(key).unwrap_or(key)
        } else {
            key
        };
        let Some(hive) = keyspace.hive_of(changed) else {
            return 0;
        };
        let mut hives = vec![hive];
        let root = keyspace.root_hive();
        if hive != root {
            hives.push(root);
        }

        let hub = Arc::downgrade(&self.inner);
        let ctx = Dispatch {
            host: self.inner.delivery.as_ref(),
            hub: &hub,
        };
        let mut releases = DeferredReleases::new();
        let mut dispatched = 0;
        {
            let mut state = self.inner.lock();
            for hive in hives {
                for sub in state.subs.matching(keyspace, hive, changed, change) {
                    if state.trigger_check(sub, self.inner.access.as_ref(), changed, change) {
                        dispatched +=
                            state.deliver(sub, DeliveryStatus::Changed, &ctx, &mut releases);
                    }
                }
            }
        }
        releases.drain();
        if dispatched > 0 {
            log_notify_debug!(
                "Change reported",
                key = tracing::field::display(changed),
                dispatched = dispatched
            );
        }
        dispatched
    }

    /// Tears down every subscription on `key` with a cleanup delivery.
    pub fn key_deleted(&self, key: KeyId) -> usize {
        let hub = Arc::downgrade(&self.inner);
        let ctx = Dispatch {
            host: self.inner.delivery.as_ref(),
            hub: &hub,
        };
        let mut releases = DeferredReleases::new();
        let mut dispatched = 0;
        {
            let mut state = self.inner.lock();
            for sub in state.subs.watching(key) {
                dispatched += state.deliver(sub, DeliveryStatus::Cleanup, &ctx, &mut releases);
                state.subs.remove(sub);
            }
        }
        releases.drain();
        dispatched
    }

    fn close_object(&self, object: &KeyObject) {
        if object.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let hub = Arc::downgrade(&self.inner);
        let ctx = Dispatch {
            host: self.inner.delivery.as_ref(),
            hub: &hub,
        };
        let mut releases = DeferredReleases::new();
        {
            let mut state = self.inner.lock();
            if let Some(sub) = state.subs.for_object(object.id) {
                state.deliver(sub, DeliveryStatus::Cleanup, &ctx, &mut releases);
                state.subs.remove(sub);
            }
        }
        releases.drain();
    }

    /// Cancels every request `owner` still has outstanding.
    pub fn rundown(&self, owner: ThreadId) -> usize {
        let mut releases = DeferredReleases::new();
        let cancelled = self.inner.lock().rundown(owner, &mut releases);
        releases.drain();
        if cancelled > 0 {
            log_notify_debug!("Owner rundown", cancelled = cancelled);
        }
        cancelled
    }

    pub fn rundown_current_thread(&self) -> usize {
        self.rundown(thread::current().id())
    }

    fn finish_sync(&self, requests: &[ReqId]) {
        let mut releases = DeferredReleases::new();
        self.inner.lock().finish_sync(requests, &mut releases);
        releases.drain();
    }

    fn cancel_sync(&self, requests: &[ReqId]) {
        let mut releases = DeferredReleases::new();
        self.inner.lock().cancel_sync(requests, &mut releases);
        releases.drain();
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subs.len()
    }

    /// Requests queued, posted, or awaiting their waiter.
    pub fn request_count(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Key objects still referenced by a handle or a request.
    pub fn live_key_objects(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Live key objects per key.
    pub fn key_object_counts(&self) -> HashMap<KeyId, usize> {
        let state = self.inner.lock();
        let mut counts = HashMap::new();
        for key in state.objects.values() {
            *counts.entry(*key).or_insert(0) += 1;
        }
        counts
    }

    /// Depths of `hive`'s subscription list in stored order.
    pub fn subscription_depths(&self, hive: HiveId) -> Vec<u32> {
        self.inner.lock().subs.depths(hive)
    }

    /// Whether a change is waiting for the next watch on `handle`.
    pub fn is_pending(&self, handle: &KeyHandle) -> bool {
        let state = self.inner.lock();
        state
            .subs
            .for_object(handle.object.id)
            .and_then(|sub| state.subs.get(sub))
            .is_some_and(|s| s.pending)
    }
}

/// An open key. Closing it (or dropping it) delivers a cleanup to its
/// outstanding watches.
pub struct KeyHandle {
    hub: NotifyHub,
    object: Arc<KeyObject>,
}

impl KeyHandle {
    pub fn key(&self) -> KeyId {
        self.object.key
    }

    pub fn hive(&self) -> HiveId {
        self.object.hive
    }

    pub fn principal(&self) -> &Principal {
        &self.object.principal
    }

    pub fn is_closed(&self) -> bool {
        self.object.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.hub.close_object(&self.object);
    }
}

impl Drop for KeyHandle {
    fn drop(&mut self) {
        self.hub.close_object(&self.object);
    }
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHandle")
            .field("key", &self.object.key)
            .field("hive", &self.object.hive)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A queued synchronous watch.
pub struct SyncWaiter {
    hub: NotifyHub,
    slot: Arc<SyncSlot>,
    requests: Vec<ReqId>,
    outcome: WatchOutcome,
    finished: bool,
}

impl SyncWaiter {
    pub fn outcome(&self) -> WatchOutcome {
        self.outcome
    }

    /// Blocks until delivery or cancellation, or until `timeout`. A timed-out
    /// waiter stays queued and may wait again.
    pub fn wait(&mut self, timeout: Option<Duration>) -> WaitResult {
        let result = self.slot.wait(timeout);
        if result != WaitResult::TimedOut && !self.finished {
            self.hub.finish_sync(&self.requests);
            self.finished = true;
        }
        result
    }
}

impl Drop for SyncWaiter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.slot.result().is_some() {
            self.hub.finish_sync(&self.requests);
        } else {
            self.hub.cancel_sync(&self.requests);
        }
    }
}

impl std::fmt::Debug for SyncWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWaiter")
            .field("outcome", &self.outcome)
            .field("result", &self.slot.result())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for NotifyHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyHub").finish_non_exhaustive()
    }
}
