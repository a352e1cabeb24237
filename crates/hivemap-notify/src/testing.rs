//! Test helpers: a delivery host that records instead of running, and an
//! access checker with a deny list.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::delivery::{AsyncDelivery, CallbackJob, WorkItemJob};
use crate::error::{NotifyError, Result};
use crate::filter::{ChangeFilter, DeliveryStatus};
use crate::hub::NotifyHub;
use crate::keyspace::{KeyId, KeyTree};
use crate::security::{AccessChecker, AllowAll, Principal};

/// A job captured by [`RecordingDelivery`].
#[derive(Debug)]
pub enum Posted {
    Callback(CallbackJob),
    WorkItem(WorkItemJob),
}

impl Posted {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Posted::Callback(job) => job.status(),
            Posted::WorkItem(job) => job.status(),
        }
    }

    pub fn run(self) {
        match self {
            Posted::Callback(job) => job.run(),
            Posted::WorkItem(job) => job.run(),
        }
    }
}

/// Keeps posted jobs in order until the test runs them.
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    posted: Mutex<Vec<Posted>>,
    refuse: AtomicUsize,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.posted.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statuses(&self) -> Vec<DeliveryStatus> {
        self.posted.lock().iter().map(Posted::status).collect()
    }

    pub fn take(&self) -> Vec<Posted> {
        std::mem::take(&mut *self.posted.lock())
    }

    /// Runs everything posted so far, oldest first.
    pub fn run_all(&self) -> usize {
        let jobs = self.take();
        let count = jobs.len();
        for job in jobs {
            job.run();
        }
        count
    }

    /// Refuses the next `count` posts.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    fn record(&self, job: Posted) -> Result<()> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(NotifyError::Enqueue("refused by test host".into()));
        }
        self.posted.lock().push(job);
        Ok(())
    }
}

impl AsyncDelivery for RecordingDelivery {
    fn post_callback(&self, job: CallbackJob) -> Result<()> {
        self.record(Posted::Callback(job))
    }

    fn post_work_item(&self, job: WorkItemJob) -> Result<()> {
        self.record(Posted::WorkItem(job))
    }
}

/// Denies every check made for the listed principals.
#[derive(Debug, Default)]
pub struct DenyList {
    denied: Mutex<HashSet<String>>,
}

impl DenyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, name: &str) {
        self.denied.lock().insert(name.to_string());
    }
}

impl AccessChecker for DenyList {
    fn check_access(&self, principal: &Principal, _key: KeyId, _change: ChangeFilter) -> bool {
        !self.denied.lock().contains(principal.name())
    }
}

/// A hub over a fresh [`KeyTree`] that records its deliveries.
pub struct TestHub {
    pub hub: NotifyHub,
    pub tree: Arc<KeyTree>,
    pub delivery: Arc<RecordingDelivery>,
}

impl TestHub {
    pub fn new() -> Self {
        Self::with_access(Arc::new(AllowAll))
    }

    pub fn with_access(access: Arc<dyn AccessChecker>) -> Self {
        let tree = Arc::new(KeyTree::new());
        let delivery = Arc::new(RecordingDelivery::new());
        let hub = NotifyHub::new(tree.clone(), access, delivery.clone());
        Self {
            hub,
            tree,
            delivery,
        }
    }
}

impl Default for TestHub {
    fn default() -> Self {
        Self::new()
    }
}
