//! Delivery of changes to queued requests.
//!
//! Everything here runs with the notify lock held. Requests live in one slab
//! and are reachable from at most three places: their subscription's queue,
//! their owner's list, and their group partner. Every unlink is idempotent
//! (generation-checked keys), so rundown, handle close and delivery may reach
//! the same request from different directions without double frees.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use hivemap_config::{log_notify_debug, log_notify_trace, log_notify_warn};
use hivemap_slab::{List, Slab};

use crate::delivery::{AsyncDelivery, CallbackJob, WorkItemJob};
use crate::filter::{ChangeFilter, DeliveryStatus};
use crate::hub::{HubInner, KeyObject, ObjectId};
use crate::keyspace::KeyId;
use crate::release::DeferredReleases;
use crate::request::{Custody, ReqId, Request, Role, Target, WaitResult};
use crate::security::AccessChecker;
use crate::subscription::{SubId, SubscriptionRegistry};

/// Where a new request goes on its owner's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OwnerEnd {
    Front,
    Back,
}

/// Collaborators a delivery may post to.
pub(crate) struct Dispatch<'a> {
    pub host: &'a dyn AsyncDelivery,
    pub hub: &'a Weak<HubInner>,
}

#[derive(Default)]
pub(crate) struct NotifyState {
    pub subs: SubscriptionRegistry,
    pub requests: Slab<Request>,
    pub owners: HashMap<ThreadId, List<ReqId>>,
    /// Live key objects, for leak accounting
    pub objects: HashMap<ObjectId, KeyId>,
}

impl NotifyState {
    /// Appends a request to `sub`'s queue and to its owner's list.
    pub fn enqueue(
        &mut self,
        sub: SubId,
        target: Target,
        role: Role,
        owner: ThreadId,
        object: Arc<KeyObject>,
        end: OwnerEnd,
    ) -> ReqId {
        let id = self.requests.insert(Request {
            target,
            role,
            custody: Custody::Queued,
            owner,
            object: Some(object),
            queued_on: None,
            owner_node: None,
        });
        let queue_node = self
            .subs
            .get_mut(sub)
            .map(|s| s.queue.push_back(id))
            .map(|node| (sub, node));
        let owned = self.owners.entry(owner).or_default();
        let owner_node = match end {
            OwnerEnd::Front => owned.push_front(id),
            OwnerEnd::Back => owned.push_back(id),
        };
        let request = &mut self.requests[id];
        request.queued_on = queue_node;
        request.owner_node = Some(owner_node);
        id
    }

    fn unqueue(&mut self, id: ReqId) {
        let Some(request) = self.requests.get_mut(id) else {
            return;
        };
        if let Some((sub, node)) = request.queued_on.take() {
            if let Some(sub) = self.subs.get_mut(sub) {
                sub.queue.remove(node);
            }
        }
    }

    fn unlist_owner(&mut self, id: ReqId) {
        let Some(request) = self.requests.get_mut(id) else {
            return;
        };
        let Some(node) = request.owner_node.take() else {
            return;
        };
        if let Some(list) = self.owners.get_mut(&request.owner) {
            list.remove(node);
            if list.is_empty() {
                let owner = request.owner;
                self.owners.remove(&owner);
            }
        }
    }

    /// Unlinks a request from every list and frees it. The key-object
    /// reference it held goes to `releases`. Freeing a freed request is a
    /// no-op.
    pub fn free(&mut self, id: ReqId, releases: &mut DeferredReleases) -> bool {
        self.unqueue(id);
        self.unlist_owner(id);
        let Some(mut request) = self.requests.remove(id) else {
            return false;
        };
        if let Some(object) = request.object.take() {
            releases.defer(object);
        }
        true
    }

    /// Frees the partner of `id` and leaves `id` a driver with no group.
    pub fn cancel_linked(&mut self, id: ReqId, releases: &mut DeferredReleases) {
        let Some(partner) = self.requests.get(id).and_then(Request::partner) else {
            return;
        };
        if self.free(partner, releases) {
            log_notify_trace!("Cancelled linked request");
        }
        if let Some(request) = self.requests.get_mut(id) {
            request.role = Role::Driver { linked: None };
        }
    }

    /// Frees `id` and whatever is linked to it.
    pub fn cancel_group(&mut self, id: ReqId, releases: &mut DeferredReleases) {
        self.cancel_linked(id, releases);
        self.free(id, releases);
    }

    /// Makes `id` the driver of its group.
    fn promote(&mut self, id: ReqId) {
        let Some(Role::Linked { driver }) = self.requests.get(id).map(|r| r.role) else {
            return;
        };
        let linked = match self.requests.get_mut(driver) {
            Some(old) => {
                old.role = Role::Linked { driver: id };
                Some(driver)
            }
            None => None,
        };
        self.requests[id].role = Role::Driver { linked };
    }

    /// Gate in front of delivery: work-item (in-process) subscribers always
    /// pass, everyone else must pass the access check.
    pub fn trigger_check(
        &self,
        sub: SubId,
        access: &dyn AccessChecker,
        changed: KeyId,
        change: ChangeFilter,
    ) -> bool {
        let Some(subscription) = self.subs.get(sub) else {
            return false;
        };
        let front = subscription
            .queue
            .front()
            .and_then(|node| subscription.queue.get(node))
            .and_then(|id| self.requests.get(*id));
        if let Some(request) = front {
            if matches!(request.target, Target::WorkItem { .. }) {
                return true;
            }
        }
        access.check_access(&subscription.principal, changed, change)
    }

    /// Delivers `status` to every request queued on `sub`, oldest first.
    /// With nothing queued, a change is remembered as pending instead.
    /// Returns how many requests were dispatched.
    pub fn deliver(
        &mut self,
        sub: SubId,
        status: DeliveryStatus,
        ctx: &Dispatch<'_>,
        releases: &mut DeferredReleases,
    ) -> usize {
        let Some(subscription) = self.subs.get_mut(sub) else {
            return 0;
        };
        if subscription.queue.is_empty() {
            if status == DeliveryStatus::Changed {
                subscription.pending = true;
                log_notify_trace!("No request queued, change left pending");
            }
            return 0;
        }
        subscription.pending = false;

        let mut dispatched = 0;
        while let Some(id) = self.subs.get_mut(sub).and_then(|s| s.queue.pop_front()) {
            let Some(request) = self.requests.get_mut(id) else {
                continue;
            };
            request.queued_on = None;

            if status == DeliveryStatus::Cleanup {
                if let Role::Linked { driver } = request.role {
                    // The driver still watches its own key; only this half goes.
                    if let Some(driver) = self.requests.get_mut(driver) {
                        driver.role = Role::Driver { linked: None };
                    }
                    self.free(id, releases);
                    continue;
                }
            }

            self.promote(id);
            self.cancel_linked(id, releases);
            self.dispatch(id, status, ctx, releases);
            dispatched += 1;
        }
        dispatched
    }

    fn dispatch(
        &mut self,
        id: ReqId,
        status: DeliveryStatus,
        ctx: &Dispatch<'_>,
        releases: &mut DeferredReleases,
    ) {
        let target = self.requests[id].target.clone();
        log_notify_debug!("Delivering", mode = target.kind(), status = tracing::field::debug(status));
        match target {
            Target::Sync(slot) => {
                self.requests[id].custody = Custody::Waiter;
                slot.complete(WaitResult::Delivered(status));
            }
            Target::Callback { routine, event } => {
                let job = CallbackJob::new(ctx.hub.clone(), id, status, routine, event.clone());
                match ctx.host.post_callback(job) {
                    Ok(()) => self.requests[id].custody = Custody::Posted,
                    Err(err) => {
                        log_notify_warn!(
                            "Callback could not be queued, completing inline",
                            error = tracing::field::display(&err)
                        );
                        if let Some(event) = event {
                            event.signal(status);
                        }
                        self.free(id, releases);
                    }
                }
            }
            Target::WorkItem { item, event } => {
                if let Err(err) = ctx.host.post_work_item(WorkItemJob::new(item, status)) {
                    log_notify_warn!(
                        "Work item could not be queued",
                        error = tracing::field::display(&err)
                    );
                }
                if let Some(event) = event {
                    event.signal(status);
                }
                self.free(id, releases);
            }
        }
    }

    /// Completes a callback delivery. False when rundown got there first.
    pub fn finish_posted(&mut self, id: ReqId, releases: &mut DeferredReleases) -> bool {
        match self.requests.get(id) {
            Some(request) if request.custody == Custody::Posted => {
                self.cancel_group(id, releases);
                true
            }
            _ => false,
        }
    }

    /// Frees the delivered members of a synchronous watch.
    pub fn finish_sync(&mut self, ids: &[ReqId], releases: &mut DeferredReleases) {
        for id in ids {
            if self
                .requests
                .get(*id)
                .is_some_and(|r| r.custody == Custody::Waiter)
            {
                self.cancel_group(*id, releases);
            }
        }
    }

    /// Cancels a synchronous watch that was never delivered.
    pub fn cancel_sync(&mut self, ids: &[ReqId], releases: &mut DeferredReleases) {
        for id in ids {
            if let Some(Target::Sync(slot)) = self.requests.get(*id).map(|r| r.target.clone()) {
                slot.complete(WaitResult::Removed);
            }
            self.cancel_group(*id, releases);
        }
    }

    /// Cancels everything `owner` still has outstanding. A linked member whose
    /// driver is still on the list is moved to the tail; the driver frees it.
    /// Returns how many groups were cancelled.
    pub fn rundown(&mut self, owner: ThreadId, releases: &mut DeferredReleases) -> usize {
        let mut cancelled = 0;
        loop {
            let Some(list) = self.owners.get_mut(&owner) else {
                break;
            };
            let Some(id) = list.pop_front() else {
                self.owners.remove(&owner);
                break;
            };
            let Some(request) = self.requests.get_mut(id) else {
                continue;
            };
            request.owner_node = None;
            let (role, target) = (request.role, request.target.clone());

            if let Role::Linked { driver } = role {
                let driver_waiting = self
                    .requests
                    .get(driver)
                    .is_some_and(|d| d.owner == owner && d.owner_node.is_some());
                if driver_waiting {
                    let node = self.owners.entry(owner).or_default().push_back(id);
                    self.requests[id].owner_node = Some(node);
                    continue;
                }
            }

            match &target {
                Target::Sync(slot) => slot.complete(WaitResult::Removed),
                Target::Callback { event, .. } => {
                    if let Some(event) = event {
                        event.signal(DeliveryStatus::Cleanup);
                    }
                }
                Target::WorkItem { .. } => {}
            }
            self.cancel_group(id, releases);
            cancelled += 1;
        }
        cancelled
    }
}
