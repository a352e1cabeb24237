//! Randomized and scenario tests for the view cache, driven through the
//! registry against the in-memory host.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use hivemap_config::testing::pattern_byte;
use hivemap_config::{HostConfig, ViewConfig};
use hivemap_view::testing::FakeCacheManager;
use hivemap_view::{ViewCacheRegistry, ViewError, ViewRef, ViewState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const VIEW: u32 = 4096;

fn registry(max_views: u32) -> (Arc<FakeCacheManager>, ViewCacheRegistry) {
    let host = Arc::new(FakeCacheManager::new());
    let views = ViewConfig {
        view_size: VIEW,
        page_size: VIEW,
        max_views_per_file: max_views,
    };
    let reg = ViewCacheRegistry::with_sections(host.clone(), views, HostConfig::default());
    (host, reg)
}

fn check_bytes(view: &ViewRef<'_>) {
    let bytes = view.bytes();
    for probe in [0usize, 1, bytes.len() / 2, bytes.len() - 1] {
        assert_eq!(
            bytes[probe],
            pattern_byte(view.offset() + probe as u64),
            "view at {:#x} lost its content",
            view.offset()
        );
    }
}

#[test]
fn test_lru_scenario() {
    let (host, reg) = registry(2);
    host.register_file(Path::new("/lru"), 4 * u64::from(VIEW));
    let file = reg.open("/lru").unwrap();
    let g = file.lock_shared();

    drop(g.map(0).unwrap());
    drop(g.map(4096).unwrap());
    assert_eq!(file.lru_offsets(), vec![4096, 0]);

    // touching A makes B the eviction victim
    drop(g.map(100).unwrap());
    drop(g.map(8192).unwrap());
    assert_eq!(file.lru_offsets(), vec![8192, 0]);
    assert!(file.view_at(4096).is_none());
    assert_eq!(file.stats().evictions, 1);
}

#[test]
fn test_random_operations_keep_invariants() {
    let views = 16u64;
    let max_views = 4u32;
    let (host, reg) = registry(max_views);
    host.register_file(Path::new("/model"), views * u64::from(VIEW) - 100);
    let file = reg.open("/model").unwrap();

    let mut rng = StdRng::seed_from_u64(0x6869_7665);
    let g = file.lock_shared();
    let mut live: Vec<(ViewRef<'_>, usize)> = Vec::new();
    let mut peak_referenced = 0usize;

    for step in 0..2_000 {
        if live.is_empty() || (live.len() < 6 && rng.gen_bool(0.55)) {
            let offset = rng.gen_range(0..file.len());
            let view = g.map(offset).unwrap();
            assert!(view.offset() <= offset && offset < view.offset() + u64::from(view.len()));
            let address = view.address();
            live.push((view, address));
        } else {
            let idx = rng.gen_range(0..live.len());
            live.swap_remove(idx);
        }

        let mut refs: HashMap<u64, u32> = HashMap::new();
        for (view, address) in &live {
            *refs.entry(view.offset()).or_default() += 1;
            let info = file.view_at(view.offset()).unwrap();
            assert_eq!(info.address, Some(*address), "step {step}: referenced view moved");
            check_bytes(view);
        }
        for (offset, count) in &refs {
            assert_eq!(file.view_at(*offset).unwrap().use_count, *count, "step {step}");
        }
        peak_referenced = peak_referenced.max(refs.len());

        let stats = file.stats();
        assert!(
            stats.resident <= (max_views as usize).max(peak_referenced) + 1,
            "step {step}: {} resident",
            stats.resident
        );
    }

    drop(live);
    drop(g);
    reg.close(file.id()).unwrap();
    assert_eq!(host.live_handles(), 0);
    assert_eq!(host.live_ranges(), 0);
}

#[test]
fn test_pin_failure_scenario() {
    let (host, reg) = registry(4);
    host.register_file(Path::new("/pinfail"), 4 * u64::from(VIEW));
    let file = reg.open("/pinfail").unwrap();
    let g = file.lock_exclusive();

    let view = g.map(4096).unwrap();
    host.fail_next_pins(1);
    assert!(matches!(g.pin(&view), Err(ViewError::PinFailed { offset: 4096, .. })));

    let info = file.view_at(4096).unwrap();
    assert_eq!(info.state, ViewState::Mapped);
    assert_eq!(info.use_count, 1);
    assert_eq!(info.address, Some(view.address()));

    let fresh = host.counters().fresh_maps;
    let again = g.map(4096).unwrap();
    assert_eq!(again.address(), view.address());
    assert_eq!(host.counters().fresh_maps, fresh);
}

#[test]
fn test_out_of_resources_after_failed_sweep() {
    let (host, reg) = registry(4);
    host.register_file(Path::new("/a"), 4 * u64::from(VIEW));
    host.register_file(Path::new("/b"), 4 * u64::from(VIEW));
    let a = reg.open("/a").unwrap();
    let b = reg.open("/b").unwrap();
    host.set_max_live_ranges(Some(1));

    let ga = a.lock_shared();
    let held = ga.map(0).unwrap();

    let gb = b.lock_shared();
    let err = gb.map(0).unwrap_err();
    assert!(matches!(err, ViewError::OutOfResources { offset: 0 }));
    assert!(err.is_retryable());

    drop(held);
    let ok = gb.map(0).unwrap();
    check_bytes(&ok);
}

#[test]
fn test_concurrent_files_sweep_without_deadlock() {
    let (host, reg) = registry(3);
    for name in ["/c1", "/c2", "/c3"] {
        host.register_file(Path::new(name), 8 * u64::from(VIEW));
    }
    let files: Vec<_> = ["/c1", "/c2", "/c3"]
        .iter()
        .map(|p| reg.open(p).unwrap())
        .collect();
    host.set_max_live_ranges(Some(4));

    std::thread::scope(|s| {
        for (n, file) in files.iter().enumerate() {
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(n as u64);
                let mut mapped = 0;
                for _ in 0..300 {
                    let g = file.lock_shared();
                    let offset = rng.gen_range(0..file.len());
                    match g.map(offset) {
                        Ok(view) => {
                            check_bytes(&view);
                            mapped += 1;
                        }
                        Err(ViewError::OutOfResources { .. }) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    };
                }
                assert!(mapped > 0);
            });
        }
    });

    assert!(host.live_ranges() <= 4);
    for file in &files {
        reg.close(file.id()).unwrap();
    }
    assert_eq!(host.live_handles(), 0);
}

#[test]
fn test_recover_use_counts_after_lost_references() {
    let (host, reg) = registry(4);
    host.register_file(Path::new("/recover"), 4 * u64::from(VIEW));
    let file = reg.open("/recover").unwrap();

    {
        let g = file.lock_shared();
        let leaked = g.map(0).unwrap();
        std::mem::forget(leaked);
    }
    assert_eq!(file.view_at(0).unwrap().use_count, 1);
    assert!(matches!(reg.close(file.id()), Err(ViewError::FileBusy { in_use: 1 })));

    file.lock_exclusive().recover_use_counts();
    assert_eq!(file.view_at(0).unwrap().use_count, 0);
    reg.close(file.id()).unwrap();
    assert_eq!(host.live_handles(), 0);
}
