//! Asynchronous delivery host.
//!
//! Callback and work-item deliveries are posted as jobs and run later, never
//! inline: posting happens under the notify lock, and a job that completes a
//! callback takes that lock again.
//!
//! ```text
//! dispatcher ──try_send──▶ bounded queue ──▶ worker thread ──▶ job.run()
//!  (notify lock)            (backpressure)                     (no lock)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, Sender, TrySendError};
use hivemap_config::{log_notify_debug, log_notify_trace, NotifyConfig};
use parking_lot::Mutex;

use crate::error::{NotifyError, Result};
use crate::filter::DeliveryStatus;
use crate::hub::HubInner;
use crate::request::{CallbackRoutine, NotifyEvent, ReqId, WorkItemRoutine};

/// Something that runs posted jobs later, on its own schedule.
pub trait AsyncDelivery: Send + Sync {
    /// Queues a callback completion. Must not run the job inline.
    fn post_callback(&self, job: CallbackJob) -> Result<()>;

    /// Queues a work item. Must not run the job inline.
    fn post_work_item(&self, job: WorkItemJob) -> Result<()>;
}

/// Completion of a callback watch.
pub struct CallbackJob {
    hub: Weak<HubInner>,
    request: ReqId,
    status: DeliveryStatus,
    routine: CallbackRoutine,
    event: Option<Arc<NotifyEvent>>,
}

impl CallbackJob {
    pub(crate) fn new(
        hub: Weak<HubInner>,
        request: ReqId,
        status: DeliveryStatus,
        routine: CallbackRoutine,
        event: Option<Arc<NotifyEvent>>,
    ) -> Self {
        Self {
            hub,
            request,
            status,
            routine,
            event,
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    /// Frees the request, then signals the event and runs the routine. Does
    /// nothing if the watch was cancelled after posting.
    pub fn run(self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let live = hub.finish_posted(self.request);
        drop(hub);
        if !live {
            log_notify_trace!("Posted callback was cancelled");
            return;
        }
        if let Some(event) = &self.event {
            event.signal(self.status);
        }
        (self.routine)(self.status);
    }
}

impl std::fmt::Debug for CallbackJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackJob")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A posted in-process work item.
pub struct WorkItemJob {
    item: WorkItemRoutine,
    status: DeliveryStatus,
}

impl WorkItemJob {
    pub(crate) fn new(item: WorkItemRoutine, status: DeliveryStatus) -> Self {
        Self { item, status }
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    pub fn run(self) {
        (self.item)(self.status);
    }
}

impl std::fmt::Debug for WorkItemJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItemJob")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

enum Job {
    Callback(CallbackJob),
    WorkItem(WorkItemJob),
}

/// Single worker thread draining a bounded queue.
pub struct WorkerDelivery {
    tx: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    executed: Arc<AtomicU64>,
}

impl WorkerDelivery {
    pub fn start(capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Job>(capacity.max(1));
        let executed = Arc::new(AtomicU64::new(0));
        let counter = executed.clone();
        let worker = thread::Builder::new()
            .name("hivemap-notify".into())
            .spawn(move || {
                for job in rx.iter() {
                    match job {
                        Job::Callback(job) => job.run(),
                        Job::WorkItem(job) => job.run(),
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                log_notify_debug!("Delivery worker stopped");
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
            executed,
        })
    }

    pub fn from_config(config: &NotifyConfig) -> std::io::Result<Self> {
        Self::start(config.worker_queue_capacity)
    }

    /// Jobs run so far.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Stops accepting jobs, runs what is queued, and joins the worker.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            // a job holding the last reference shuts us down from the worker
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }

    fn send(&self, job: Job) -> Result<()> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(NotifyError::Enqueue("delivery worker stopped".into()));
        };
        tx.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => NotifyError::Enqueue("delivery queue full".into()),
            TrySendError::Disconnected(_) => {
                NotifyError::Enqueue("delivery worker stopped".into())
            }
        })
    }
}

impl AsyncDelivery for WorkerDelivery {
    fn post_callback(&self, job: CallbackJob) -> Result<()> {
        self.send(Job::Callback(job))
    }

    fn post_work_item(&self, job: WorkItemJob) -> Result<()> {
        self.send(Job::WorkItem(job))
    }
}

impl Drop for WorkerDelivery {
    fn drop(&mut self) {
        self.shutdown();
    }
}
