use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hivemap_notify::testing::{DenyList, TestHub};
use hivemap_notify::{
    CallbackRoutine, ChangeFilter, DeliveryStatus, HiveId, KeyHandle, NotifyError, NotifyEvent,
    NotifyHub, Principal, WaitResult, WatchOutcome, WatchSpec, WorkItemRoutine, WorkerDelivery,
};
use parking_lot::Mutex;

fn open(t: &TestHub, path: &str) -> KeyHandle {
    let key = t.tree.key(path).unwrap_or_else(|| t.tree.create(path));
    t.hub.open_key(key, Principal::new("alice")).unwrap()
}

fn labelled(log: &Arc<Mutex<Vec<String>>>, label: &str) -> CallbackRoutine {
    let log = log.clone();
    let label = label.to_string();
    Arc::new(move |status| log.lock().push(format!("{label}:{status:?}")))
}

fn counting(count: &Arc<AtomicUsize>) -> CallbackRoutine {
    let count = count.clone();
    Arc::new(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn test_depth_order_and_fifo_delivery() {
    let t = TestHub::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let c = open(&t, "/a/b/c");
    let a1 = open(&t, "/a");
    let e = open(&t, "/a/b/c/d/e");
    let a2 = open(&t, "/a");

    for (handle, label) in [(&c, "c"), (&a1, "a1"), (&e, "e"), (&a2, "a2")] {
        let spec = WatchSpec::new(ChangeFilter::LAST_SET).subtree();
        let outcome = t
            .hub
            .watch_callback(handle, &spec, labelled(&log, label), None)
            .unwrap();
        assert_eq!(outcome, WatchOutcome::Pending);
    }
    assert_eq!(t.hub.subscription_depths(HiveId::ROOT), vec![1, 1, 3, 5]);

    assert_eq!(t.hub.report_change(e.key(), ChangeFilter::LAST_SET), 4);
    assert_eq!(t.delivery.run_all(), 4);
    assert_eq!(
        *log.lock(),
        vec!["a1:Changed", "a2:Changed", "c:Changed", "e:Changed"]
    );
    assert_eq!(t.hub.request_count(), 0);
}

#[test]
fn test_subtree_scope() {
    let t = TestHub::new();
    let count = Arc::new(AtomicUsize::new(0));
    let a = open(&t, "/a");
    let deep = t.tree.create("/a/b/c");
    let other = t.tree.create("/x");

    let spec = WatchSpec::new(ChangeFilter::all()).subtree();
    t.hub.watch_callback(&a, &spec, counting(&count), None).unwrap();
    assert_eq!(t.hub.report_change(other, ChangeFilter::LAST_SET), 0);
    assert_eq!(t.hub.report_change(deep, ChangeFilter::LAST_SET), 1);
    t.delivery.run_all();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_name_change_reported_on_parent() {
    let t = TestHub::new();
    let a = open(&t, "/a");
    let spec = WatchSpec::new(ChangeFilter::NAME);
    let mut waiter = t.hub.watch_sync(&a, &spec).unwrap();

    let child = t.tree.create("/a/new");
    assert_eq!(t.hub.report_change(child, ChangeFilter::NAME), 1);
    assert_eq!(
        waiter.wait(Some(Duration::from_secs(1))),
        WaitResult::Delivered(DeliveryStatus::Changed)
    );
}

#[test]
fn test_changes_also_reach_root_file() {
    let t = TestHub::new();
    t.tree.mount("/soft", HiveId(2));
    let root = t.hub.open_key(t.tree.root(), Principal::new("alice")).unwrap();
    let soft = open(&t, "/soft");
    let app = t.tree.create("/soft/app");

    let spec = WatchSpec::new(ChangeFilter::LAST_SET).subtree();
    let mut on_root = t.hub.watch_sync(&root, &spec).unwrap();
    let mut on_soft = t.hub.watch_sync(&soft, &spec).unwrap();

    assert_eq!(t.hub.report_change(app, ChangeFilter::LAST_SET), 2);
    let wait = Some(Duration::from_secs(1));
    assert_eq!(on_root.wait(wait), WaitResult::Delivered(DeliveryStatus::Changed));
    assert_eq!(on_soft.wait(wait), WaitResult::Delivered(DeliveryStatus::Changed));
}

#[test]
fn test_pending_change_triggers_next_watch() {
    let t = TestHub::new();
    let a = open(&t, "/a");
    let spec = WatchSpec::new(ChangeFilter::LAST_SET);

    let mut first = t.hub.watch_sync(&a, &spec).unwrap();
    assert_eq!(t.hub.report_change(a.key(), ChangeFilter::LAST_SET), 1);
    first.wait(None);
    assert!(!t.hub.is_pending(&a));

    // nobody waiting: remembered
    assert_eq!(t.hub.report_change(a.key(), ChangeFilter::LAST_SET), 0);
    assert!(t.hub.is_pending(&a));

    let mut second = t.hub.watch_sync(&a, &spec).unwrap();
    assert_eq!(second.outcome(), WatchOutcome::Triggered);
    assert_eq!(
        second.wait(Some(Duration::ZERO)),
        WaitResult::Delivered(DeliveryStatus::Changed)
    );
    assert!(!t.hub.is_pending(&a));
    assert_eq!(t.hub.request_count(), 0);
}

#[test]
fn test_pending_on_secondary_triggers() {
    let t = TestHub::new();
    t.tree.mount("/soft", HiveId(2));
    let sys = open(&t, "/sys");
    let app = open(&t, "/soft/app");
    let spec = WatchSpec::new(ChangeFilter::LAST_SET);

    drop(t.hub.watch_sync(&app, &spec).unwrap());
    t.hub.report_change(app.key(), ChangeFilter::LAST_SET);
    assert!(t.hub.is_pending(&app));

    let linked = WatchSpec::new(ChangeFilter::LAST_SET).with_secondary(&app);
    let mut waiter = t.hub.watch_sync(&sys, &linked).unwrap();
    assert_eq!(waiter.outcome(), WatchOutcome::Triggered);
    assert_eq!(
        waiter.wait(Some(Duration::ZERO)),
        WaitResult::Delivered(DeliveryStatus::Changed)
    );
    assert_eq!(t.hub.request_count(), 0);
}

#[test]
fn test_linked_group_cancel_leaves_nothing_behind() {
    let t = TestHub::new();
    t.tree.mount("/soft", HiveId(2));
    let sys = open(&t, "/sys");
    let app = open(&t, "/soft/app");

    let spec = WatchSpec::new(ChangeFilter::LAST_SET).with_secondary(&app);
    let waiter = t.hub.watch_sync(&sys, &spec).unwrap();
    assert_eq!(t.hub.request_count(), 2);
    assert_eq!(t.hub.subscription_count(), 2);

    drop(waiter);
    assert_eq!(t.hub.request_count(), 0);

    drop(sys);
    drop(app);
    assert_eq!(t.hub.subscription_count(), 0);
    assert_eq!(t.hub.live_key_objects(), 0);
}

#[test]
fn test_closing_primary_cleans_up_group() {
    let t = TestHub::new();
    t.tree.mount("/soft", HiveId(2));
    let sys = open(&t, "/sys");
    let app = open(&t, "/soft/app");

    let spec = WatchSpec::new(ChangeFilter::LAST_SET).with_secondary(&app);
    let mut waiter = t.hub.watch_sync(&sys, &spec).unwrap();
    sys.close();
    assert_eq!(
        waiter.wait(Some(Duration::from_secs(1))),
        WaitResult::Delivered(DeliveryStatus::Cleanup)
    );
    assert_eq!(t.hub.request_count(), 0);
    drop(waiter);
    drop(sys);
    drop(app);
    assert_eq!(t.hub.live_key_objects(), 0);
}

#[test]
fn test_closing_secondary_keeps_primary_watching() {
    let t = TestHub::new();
    t.tree.mount("/soft", HiveId(2));
    let sys = open(&t, "/sys");
    let app = open(&t, "/soft/app");

    let spec = WatchSpec::new(ChangeFilter::LAST_SET).with_secondary(&app);
    let mut waiter = t.hub.watch_sync(&sys, &spec).unwrap();
    app.close();
    assert_eq!(t.hub.request_count(), 1);
    assert_eq!(waiter.wait(Some(Duration::from_millis(10))), WaitResult::TimedOut);

    t.hub.report_change(sys.key(), ChangeFilter::LAST_SET);
    assert_eq!(
        waiter.wait(Some(Duration::from_secs(1))),
        WaitResult::Delivered(DeliveryStatus::Changed)
    );
    assert_eq!(t.hub.request_count(), 0);
}

#[test]
fn test_change_on_secondary_completes_group() {
    let t = TestHub::new();
    t.tree.mount("/soft", HiveId(2));
    let sys = open(&t, "/sys");
    let app = open(&t, "/soft/app");
    let log = Arc::new(Mutex::new(Vec::new()));

    let spec = WatchSpec::new(ChangeFilter::LAST_SET).with_secondary(&app);
    t.hub
        .watch_callback(&sys, &spec, labelled(&log, "group"), None)
        .unwrap();
    assert_eq!(t.hub.report_change(app.key(), ChangeFilter::LAST_SET), 1);
    // primary was cancelled at delivery
    assert_eq!(t.hub.report_change(sys.key(), ChangeFilter::LAST_SET), 0);
    t.delivery.run_all();
    assert_eq!(*log.lock(), vec!["group:Changed"]);
    assert_eq!(t.hub.request_count(), 0);
}

#[test]
fn test_rundown_cancels_callbacks_without_running_them() {
    let t = TestHub::new();
    let a = open(&t, "/a");
    let b = open(&t, "/b");
    let count = Arc::new(AtomicUsize::new(0));
    let queued = NotifyEvent::new();
    let posted = NotifyEvent::new();
    let spec = WatchSpec::new(ChangeFilter::LAST_SET);

    t.hub
        .watch_callback(&a, &spec, counting(&count), Some(queued.clone()))
        .unwrap();
    t.hub
        .watch_callback(&b, &spec, counting(&count), Some(posted.clone()))
        .unwrap();
    t.hub.report_change(b.key(), ChangeFilter::LAST_SET);
    assert_eq!(t.delivery.len(), 1);

    assert_eq!(t.hub.rundown_current_thread(), 2);
    assert_eq!(queued.status(), Some(DeliveryStatus::Cleanup));
    assert_eq!(posted.status(), Some(DeliveryStatus::Cleanup));

    t.delivery.run_all();
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(t.hub.request_count(), 0);
    assert_eq!(t.hub.rundown_current_thread(), 0);
}

#[test]
fn test_rundown_of_linked_group_counts_once() {
    let t = TestHub::new();
    t.tree.mount("/soft", HiveId(2));
    let sys = open(&t, "/sys");
    let app = open(&t, "/soft/app");

    let spec = WatchSpec::new(ChangeFilter::LAST_SET).with_secondary(&app);
    let mut waiter = t.hub.watch_sync(&sys, &spec).unwrap();
    assert_eq!(t.hub.rundown_current_thread(), 1);
    assert_eq!(waiter.wait(Some(Duration::ZERO)), WaitResult::Removed);
    assert_eq!(t.hub.request_count(), 0);
    assert_eq!(t.hub.rundown_current_thread(), 0);
}

#[test]
fn test_rundown_only_touches_its_owner() {
    let t = TestHub::new();
    let a = open(&t, "/a");
    let spec = WatchSpec::new(ChangeFilter::LAST_SET);
    let _mine = t.hub.watch_sync(&a, &spec).unwrap();

    let other = std::thread::spawn(|| std::thread::current().id())
        .join()
        .unwrap();
    assert_eq!(t.hub.rundown(other), 0);
    assert_eq!(t.hub.request_count(), 1);
}

#[test]
fn test_last_release_after_delivery_does_not_deadlock() {
    let t = TestHub::new();
    let a = open(&t, "/a");
    let log = Arc::new(Mutex::new(Vec::new()));
    let spec = WatchSpec::new(ChangeFilter::LAST_SET);
    t.hub
        .watch_callback(&a, &spec, labelled(&log, "a"), None)
        .unwrap();

    drop(a);
    // the posted cleanup still holds the key object
    assert_eq!(t.hub.live_key_objects(), 1);
    t.delivery.run_all();
    assert_eq!(*log.lock(), vec!["a:Cleanup"]);
    assert_eq!(t.hub.live_key_objects(), 0);
}

#[test]
fn test_sync_timeout_then_drop_removes_request() {
    let t = TestHub::new();
    let a = open(&t, "/a");
    let mut waiter = t
        .hub
        .watch_sync(&a, &WatchSpec::new(ChangeFilter::LAST_SET))
        .unwrap();
    assert_eq!(waiter.wait(Some(Duration::from_millis(10))), WaitResult::TimedOut);
    assert_eq!(t.hub.request_count(), 1);
    drop(waiter);
    assert_eq!(t.hub.request_count(), 0);
}

#[test]
fn test_key_deleted_cleans_up_watchers() {
    let t = TestHub::new();
    let a = open(&t, "/a");
    let mut waiter = t
        .hub
        .watch_sync(&a, &WatchSpec::new(ChangeFilter::LAST_SET))
        .unwrap();
    t.tree.delete(a.key());
    assert_eq!(t.hub.key_deleted(a.key()), 1);
    assert_eq!(
        waiter.wait(Some(Duration::ZERO)),
        WaitResult::Delivered(DeliveryStatus::Cleanup)
    );
    assert_eq!(t.hub.subscription_count(), 0);

    let err = t
        .hub
        .watch_sync(&a, &WatchSpec::new(ChangeFilter::LAST_SET))
        .unwrap_err();
    assert!(matches!(err, NotifyError::KeyDeleted(_)));
}

#[test]
fn test_watch_rejections() {
    let t = TestHub::new();
    t.tree.mount("/soft", HiveId(2));
    let a = open(&t, "/a");
    let b = open(&t, "/b");
    let app = open(&t, "/soft/app");

    let err = t
        .hub
        .watch_sync(&a, &WatchSpec::new(ChangeFilter::empty()))
        .unwrap_err();
    assert!(matches!(err, NotifyError::InvalidFilter(0)));

    let same = WatchSpec::new(ChangeFilter::LAST_SET).with_secondary(&b);
    assert!(matches!(
        t.hub.watch_sync(&a, &same).unwrap_err(),
        NotifyError::SameFile(HiveId::ROOT)
    ));

    let item: WorkItemRoutine = Arc::new(|_| {});
    let linked = WatchSpec::new(ChangeFilter::LAST_SET).with_secondary(&app);
    assert!(matches!(
        t.hub.watch_work_item(&a, &linked, item, None).unwrap_err(),
        NotifyError::LinkedWorkItem
    ));

    let foreign = TestHub::new();
    assert!(matches!(
        foreign
            .hub
            .watch_sync(&a, &WatchSpec::new(ChangeFilter::LAST_SET))
            .unwrap_err(),
        NotifyError::HandleClosed
    ));
    assert_eq!(t.hub.request_count(), 0);
}

#[test]
fn test_access_denied_skips_subscription() {
    let deny = Arc::new(DenyList::new());
    deny.deny("eve");
    let t = TestHub::with_access(deny);
    let key = t.tree.create("/a");
    let eve = t.hub.open_key(key, Principal::new("eve")).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let spec = WatchSpec::new(ChangeFilter::LAST_SET);

    t.hub.watch_callback(&eve, &spec, counting(&count), None).unwrap();
    assert_eq!(t.hub.report_change(key, ChangeFilter::LAST_SET), 0);
    assert!(!t.hub.is_pending(&eve));
    assert!(t.delivery.is_empty());
}

#[test]
fn test_work_items_bypass_access_check() {
    let deny = Arc::new(DenyList::new());
    deny.deny("eve");
    let t = TestHub::with_access(deny);
    let key = t.tree.create("/a");
    let eve = t.hub.open_key(key, Principal::new("eve")).unwrap();
    let event = NotifyEvent::new();
    let item: WorkItemRoutine = Arc::new(|_| {});

    let spec = WatchSpec::new(ChangeFilter::LAST_SET);
    t.hub
        .watch_work_item(&eve, &spec, item, Some(event.clone()))
        .unwrap();
    assert_eq!(t.hub.report_change(key, ChangeFilter::LAST_SET), 1);
    assert_eq!(event.status(), Some(DeliveryStatus::Changed));
    // work items are freed at delivery
    assert_eq!(t.hub.request_count(), 0);
    assert_eq!(t.delivery.statuses(), vec![DeliveryStatus::Changed]);
}

#[test]
fn test_refused_post_completes_request() {
    let t = TestHub::new();
    let a = open(&t, "/a");
    let count = Arc::new(AtomicUsize::new(0));
    let event = NotifyEvent::new();

    let spec = WatchSpec::new(ChangeFilter::LAST_SET);
    t.hub
        .watch_callback(&a, &spec, counting(&count), Some(event.clone()))
        .unwrap();
    t.delivery.refuse_next(1);
    assert_eq!(t.hub.report_change(a.key(), ChangeFilter::LAST_SET), 1);
    assert_eq!(event.status(), Some(DeliveryStatus::Changed));
    assert_eq!(t.hub.request_count(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_worker_delivery_end_to_end() {
    let tree = Arc::new(hivemap_notify::KeyTree::new());
    let delivery = Arc::new(WorkerDelivery::start(16).unwrap());
    let hub = NotifyHub::new(
        tree.clone(),
        Arc::new(hivemap_notify::AllowAll),
        delivery.clone(),
    );
    let key = tree.create("/a/b");
    let handle = hub.open_key(key, Principal::new("alice")).unwrap();

    let ran = NotifyEvent::new();
    let signalled = NotifyEvent::new();
    let done = ran.clone();
    let routine: CallbackRoutine = Arc::new(move |status| done.signal(status));
    let spec = WatchSpec::new(ChangeFilter::LAST_SET);
    hub.watch_callback(&handle, &spec, routine, Some(signalled.clone()))
        .unwrap();

    let reporter = hub.clone();
    std::thread::spawn(move || reporter.report_change(key, ChangeFilter::LAST_SET))
        .join()
        .unwrap();

    let wait = Duration::from_secs(5);
    assert_eq!(signalled.wait_timeout(wait), Some(DeliveryStatus::Changed));
    assert_eq!(ran.wait_timeout(wait), Some(DeliveryStatus::Changed));
    assert_eq!(hub.request_count(), 0);
    drop(handle);
    assert_eq!(hub.live_key_objects(), 0);
    delivery.shutdown();
}

#[test]
fn test_random_operations_leave_nothing_behind() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let t = TestHub::new();
    t.tree.mount("/m", HiveId(2));
    let root_paths = ["/r", "/r/a", "/r/a/b", "/r/c"];
    let mounted_paths = ["/m/x", "/m/x/y", "/m/z"];
    let mut root_handles: Vec<KeyHandle> = root_paths.iter().map(|p| open(&t, p)).collect();
    let mut mounted: Vec<KeyHandle> = mounted_paths.iter().map(|p| open(&t, p)).collect();
    let mut waiters = Vec::new();
    let count = Arc::new(AtomicUsize::new(0));
    let mut rng = StdRng::seed_from_u64(0x6e6f74);

    for _ in 0..2_000 {
        match rng.gen_range(0..7) {
            0 => {
                let i = rng.gen_range(0..root_handles.len());
                let mut spec = WatchSpec::new(ChangeFilter::LAST_SET | ChangeFilter::NAME);
                if rng.gen_bool(0.5) {
                    spec = spec.subtree();
                }
                let j = rng.gen_range(0..mounted.len());
                if rng.gen_bool(0.3) {
                    spec = spec.with_secondary(&mounted[j]);
                }
                t.hub
                    .watch_callback(&root_handles[i], &spec, counting(&count), None)
                    .unwrap();
            }
            1 => {
                let i = rng.gen_range(0..mounted.len());
                let spec = WatchSpec::new(ChangeFilter::LAST_SET).subtree();
                waiters.push(t.hub.watch_sync(&mounted[i], &spec).unwrap());
            }
            2 | 3 => {
                let all: Vec<&str> = root_paths.iter().chain(mounted_paths.iter()).copied().collect();
                let key = t.tree.key(all[rng.gen_range(0..all.len())]).unwrap();
                t.hub.report_change(key, ChangeFilter::LAST_SET);
            }
            4 => {
                t.delivery.run_all();
            }
            5 => {
                if rng.gen_bool(0.2) {
                    t.hub.rundown_current_thread();
                } else if !waiters.is_empty() {
                    let w = waiters.swap_remove(rng.gen_range(0..waiters.len()));
                    drop(w);
                }
            }
            _ => {
                if rng.gen_bool(0.5) {
                    let i = rng.gen_range(0..root_handles.len());
                    root_handles[i] = open(&t, root_paths[i]);
                } else {
                    let i = rng.gen_range(0..mounted.len());
                    mounted[i] = open(&t, mounted_paths[i]);
                }
            }
        }
    }

    drop(waiters);
    drop(root_handles);
    drop(mounted);
    t.delivery.run_all();
    t.hub.rundown_current_thread();
    assert_eq!(t.hub.request_count(), 0);
    assert_eq!(t.hub.subscription_count(), 0);
    assert_eq!(t.hub.live_key_objects(), 0);
}
