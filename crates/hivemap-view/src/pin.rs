//! Write pinning.
//!
//! A pinned view is out of the LRU list and cannot be evicted. Releasing the
//! pin either throws the changes away (unmap + purge) or marks the range dirty
//! and remaps it in place so the address survives, then flushes.

use hivemap_config::{log_pin_debug, log_pin_warn};

use crate::cache::ViewCache;
use crate::error::{Result, ViewError};
use crate::host::FileId;
use crate::view::{ViewId, ViewState};

/// Proof that a view is pinned. Consumed by unpin.
#[derive(Debug)]
#[must_use = "a pinned view stays resident until unpinned"]
pub struct PinnedView {
    pub(crate) file: FileId,
    pub(crate) id: ViewId,
    pub(crate) offset: u64,
    pub(crate) len: u32,
}

impl PinnedView {
    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    /// File offset of the pinned range.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ViewCache {
    /// Pins a mapped view. On failure the view stays mapped and its use count
    /// is left alone.
    pub fn pin(&mut self, id: ViewId) -> Result<PinnedView> {
        let Some(view) = self.views.get_mut(id) else {
            return Err(ViewError::StaleView);
        };
        match view.state {
            ViewState::Mapped => {}
            ViewState::Pinned => {
                return Err(ViewError::AlreadyPinned {
                    offset: view.file_offset,
                })
            }
            ViewState::Unmapped => return Err(ViewError::StaleView),
        }
        let (offset, len) = (view.file_offset, view.length);
        let Some(handle) = view.cache_handle.take() else {
            return Err(ViewError::StaleView);
        };

        match self.host.pin(handle) {
            Ok(pinned) => {
                let view = &mut self.views[id];
                view.cache_handle = Some(pinned);
                view.state = ViewState::Pinned;
                if let Some(node) = view.lru_node.take() {
                    self.lru.remove(node);
                }
                self.pinned.insert(id);
                self.counters.pins += 1;
                self.views[id].check_invariants();
                log_pin_debug!("Pinned view", file = self.file.0, offset = offset);
                Ok(PinnedView {
                    file: self.file,
                    id,
                    offset,
                    len,
                })
            }
            Err((handle, source)) => {
                self.views[id].cache_handle = Some(handle);
                log_pin_warn!("Pin refused by host", file = self.file.0, offset = offset);
                Err(ViewError::PinFailed { offset, source })
            }
        }
    }

    /// Releases a pin. With `discard_changes` the range is unmapped and purged;
    /// otherwise it is marked dirty, remapped at the same address and moved to
    /// the hot end, and one cold unreferenced view is freed if the file is over
    /// its cap.
    pub fn unpin(&mut self, pinned: PinnedView, discard_changes: bool) -> Result<()> {
        if pinned.file != self.file {
            return Err(ViewError::StaleView);
        }
        let id = pinned.id;
        let Some(view) = self.views.get(id) else {
            return Err(ViewError::StaleView);
        };
        if view.state != ViewState::Pinned {
            return Err(ViewError::StaleView);
        }
        if discard_changes && view.use_count > 0 {
            return Err(ViewError::ViewInUse {
                offset: view.file_offset,
            });
        }

        self.pinned.remove(&id);
        let node = self.lru.push_back(id);
        let view = &mut self.views[id];
        view.lru_node = Some(node);
        view.state = ViewState::Mapped;
        let (offset, len) = (view.file_offset, view.length);
        let mut remap_failed = None;

        if discard_changes {
            self.unmap_view(id, true);
            self.host.purge(self.file, offset, u64::from(len));
            log_pin_debug!("Discarded pinned view", file = self.file.0, offset = offset);
        } else {
            if let Some(handle) = self.views[id].cache_handle.as_ref() {
                self.host.mark_dirty(handle);
            }
            match self.host.map(self.file, offset, len) {
                Ok(mapping) => {
                    let view = &mut self.views[id];
                    assert_eq!(
                        Some(mapping.address),
                        view.address,
                        "host moved range {offset:#x} while it was still referenced"
                    );
                    if let Some(old) = view.cache_handle.replace(mapping.handle) {
                        self.host.unmap(old);
                    }
                    self.lru.move_to_front(node);
                    if self.over_cap() {
                        self.reclaim_one(Some(id));
                    }
                }
                Err(source) => {
                    let in_use = self.views[id].use_count > 0;
                    log_pin_warn!(
                        "Remap after unpin failed",
                        file = self.file.0,
                        offset = offset,
                        in_use = in_use,
                        error = tracing::field::display(&source)
                    );
                    if in_use {
                        // the pinned handle keeps the range mapped for the
                        // readers still holding it
                        self.lru.move_to_front(node);
                    } else {
                        self.unmap_view(id, true);
                    }
                    remap_failed = Some(ViewError::HostIo { offset, source });
                }
            }
        }

        if self.flush_on_unpin {
            if let Err(err) = self.host.flush(self.file, offset, u64::from(len)) {
                log_pin_warn!(
                    "Flush after unpin failed",
                    file = self.file.0,
                    offset = offset,
                    error = tracing::field::display(&err)
                );
            }
        }
        self.counters.unpins += 1;
        self.views[id].check_invariants();
        match remap_failed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Copies `data` into a pinned view at absolute file offset `at`.
    pub fn write_pinned(&mut self, pinned: &PinnedView, at: u64, data: &[u8]) -> Result<()> {
        if pinned.file != self.file {
            return Err(ViewError::StaleView);
        }
        let view = self.views.get(pinned.id).ok_or(ViewError::StaleView)?;
        if view.state != ViewState::Pinned {
            return Err(ViewError::StaleView);
        }
        let end = at
            .checked_add(data.len() as u64)
            .filter(|end| at >= view.file_offset && *end <= view.end())
            .ok_or(ViewError::OffsetOutOfRange {
                offset: at,
                file_len: view.end(),
            })?;
        debug_assert!(end <= self.file_len());
        let address = view.address.ok_or(ViewError::StaleView)?;
        let start = (at - view.file_offset) as usize;
        // SAFETY: the range was checked against the view, and pinned views
        // stay mapped until unpinned. Callers hold the file lock exclusively.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                address.as_mut_ptr().add(start),
                data.len(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use hivemap_config::{HostConfig, ViewConfig};

    use crate::cache::ViewCache;
    use crate::error::ViewError;
    use crate::host::{CacheManager, FileId};
    use crate::testing::FakeCacheManager;
    use crate::view::ViewState;

    fn setup(max_views: u32) -> (Arc<FakeCacheManager>, ViewCache) {
        let host = Arc::new(FakeCacheManager::new());
        host.register_file(Path::new("/pin"), 64 * 1024);
        host.attach(FileId(7), Path::new("/pin")).unwrap();
        let views = ViewConfig {
            view_size: 4096,
            page_size: 4096,
            max_views_per_file: max_views,
        };
        let cache = ViewCache::new(FileId(7), host.clone(), 64 * 1024, &views, &HostConfig::default());
        (host, cache)
    }

    #[test]
    fn test_pin_unpin_keeps_address() {
        let (host, mut cache) = setup(4);
        let a = cache.map_with(0, |_| 0).unwrap();
        let pinned = cache.pin(a.id).unwrap();
        assert_eq!(cache.view_info(a.id).unwrap().state, ViewState::Pinned);
        assert!(cache.lru_offsets().is_empty());

        cache.unpin(pinned, false).unwrap();
        let info = cache.view_info(a.id).unwrap();
        assert_eq!(info.state, ViewState::Mapped);
        assert_eq!(info.address, Some(a.address.as_ptr() as usize));
        assert_eq!(cache.lru_offsets(), vec![0]);
        assert_eq!(host.counters().flushes, 1);
        cache.release(a.id, a.epoch);
    }

    #[test]
    fn test_unpin_writes_reach_backing_store() {
        let (host, mut cache) = setup(4);
        let a = cache.map_with(100, |_| 0).unwrap();
        cache.release(a.id, a.epoch);
        let pinned = cache.pin(a.id).unwrap();
        cache.write_pinned(&pinned, 100, b"hive").unwrap();
        cache.unpin(pinned, false).unwrap();
        assert_eq!(&host.file_bytes(FileId(7))[100..104], b"hive");
    }

    #[test]
    fn test_discard_drops_changes() {
        let (host, mut cache) = setup(4);
        let a = cache.map_with(0, |_| 0).unwrap();
        cache.release(a.id, a.epoch);
        let before = host.file_bytes(FileId(7))[..4].to_vec();

        let pinned = cache.pin(a.id).unwrap();
        cache.write_pinned(&pinned, 0, b"junk").unwrap();
        cache.unpin(pinned, true).unwrap();

        assert_eq!(host.file_bytes(FileId(7))[..4], before[..]);
        assert!(cache.lookup(0).is_none());
        assert_eq!(host.counters().purges, 1);
    }

    #[test]
    fn test_discard_with_reference_is_refused() {
        let (_host, mut cache) = setup(4);
        let a = cache.map_with(0, |_| 0).unwrap();
        let pinned = cache.pin(a.id).unwrap();
        let offset = pinned.offset();
        let err = cache.unpin(pinned, true).unwrap_err();
        assert!(matches!(err, ViewError::ViewInUse { offset: 0 }));
        assert_eq!(offset, 0);
        assert_eq!(cache.view_info(a.id).unwrap().state, ViewState::Pinned);
    }

    #[test]
    fn test_failed_pin_leaves_view_mapped() {
        let (host, mut cache) = setup(4);
        let a = cache.map_with(0, |_| 0).unwrap();
        host.fail_next_pins(1);

        let err = cache.pin(a.id).unwrap_err();
        assert!(matches!(err, ViewError::PinFailed { offset: 0, .. }));
        let info = cache.view_info(a.id).unwrap();
        assert_eq!(info.state, ViewState::Mapped);
        assert_eq!(info.use_count, 1);

        let fresh = host.counters().fresh_maps;
        let again = cache.map_with(0, |_| 0).unwrap();
        assert_eq!(again.id, a.id);
        assert_eq!(host.counters().fresh_maps, fresh, "no remap");
        cache.release(a.id, a.epoch);
        cache.release(again.id, again.epoch);
    }

    #[test]
    fn test_failed_remap_keeps_referenced_view() {
        let (host, mut cache) = setup(4);
        let a = cache.map_with(0, |_| 0).unwrap();
        let pinned = cache.pin(a.id).unwrap();
        cache.write_pinned(&pinned, 0, b"keep").unwrap();
        host.fail_next_maps(1);

        let err = cache.unpin(pinned, false).unwrap_err();
        assert!(matches!(err, ViewError::HostIo { offset: 0, .. }));
        let info = cache.view_info(a.id).unwrap();
        assert_eq!(info.state, ViewState::Mapped);
        assert_eq!(info.use_count, 1);
        assert_eq!(info.address, Some(a.address.as_ptr() as usize));
        assert_eq!(cache.lru_offsets(), vec![0]);
        assert_eq!(&host.file_bytes(FileId(7))[..4], b"keep");

        // the view can be pinned and released again
        let again = cache.pin(a.id).unwrap();
        cache.unpin(again, false).unwrap();
        cache.release(a.id, a.epoch);
        cache.destroy().unwrap();
        assert_eq!(host.live_handles(), 0);
    }

    #[test]
    fn test_failed_remap_unmaps_unreferenced_view() {
        let (host, mut cache) = setup(4);
        let a = cache.map_with(0, |_| 0).unwrap();
        cache.release(a.id, a.epoch);
        let pinned = cache.pin(a.id).unwrap();
        cache.write_pinned(&pinned, 0, b"gone").unwrap();
        host.fail_next_maps(1);

        assert!(matches!(
            cache.unpin(pinned, false),
            Err(ViewError::HostIo { offset: 0, .. })
        ));
        assert!(cache.lookup(0).is_none());
        assert_eq!(&host.file_bytes(FileId(7))[..4], b"gone");
        assert_eq!(host.live_handles(), 0);
    }

    #[test]
    fn test_pin_from_other_file_is_rejected() {
        let (host, mut cache) = setup(4);
        host.register_file(Path::new("/other"), 64 * 1024);
        host.attach(FileId(8), Path::new("/other")).unwrap();
        let views = ViewConfig {
            view_size: 4096,
            page_size: 4096,
            max_views_per_file: 4,
        };
        let mut other = ViewCache::new(FileId(8), host.clone(), 64 * 1024, &views, &HostConfig::default());

        let a = cache.map_with(0, |_| 0).unwrap();
        cache.release(a.id, a.epoch);
        let b = other.map_with(0, |_| 0).unwrap();
        other.release(b.id, b.epoch);
        let foreign = other.pin(b.id).unwrap();
        assert_eq!(foreign.id(), a.id, "same slot in both files");

        assert!(matches!(
            cache.write_pinned(&foreign, 0, b"x"),
            Err(ViewError::StaleView)
        ));
        assert!(matches!(cache.unpin(foreign, true), Err(ViewError::StaleView)));
        assert_eq!(cache.view_info(a.id).unwrap().state, ViewState::Mapped);
        assert_eq!(other.view_info(b.id).unwrap().state, ViewState::Pinned);
    }

    #[test]
    fn test_pinned_views_are_not_evicted() {
        let (_host, mut cache) = setup(2);
        let a = cache.map_with(0, |_| 0).unwrap();
        cache.release(a.id, a.epoch);
        let pinned = cache.pin(a.id).unwrap();

        for offset in [4096, 8192, 12288] {
            let v = cache.map_with(offset, |_| 0).unwrap();
            cache.release(v.id, v.epoch);
        }
        assert_eq!(cache.view_info(a.id).unwrap().state, ViewState::Pinned);
        assert_eq!(cache.pinned_count() + cache.lru_offsets().len(), 2);
        cache.unpin(pinned, false).unwrap();
    }

    #[test]
    fn test_unpin_over_cap_frees_cold_view() {
        let (_host, mut cache) = setup(2);
        let a = cache.map_with(0, |_| 0).unwrap();
        let pinned = cache.pin(a.id).unwrap();
        let b = cache.map_with(4096, |_| 0).unwrap();
        // both referenced: third map goes over the cap
        let c = cache.map_with(8192, |_| 0).unwrap();
        cache.release(b.id, b.epoch);
        cache.release(c.id, c.epoch);
        assert_eq!(cache.stats().resident, 3);

        cache.unpin(pinned, false).unwrap();
        assert_eq!(cache.stats().resident, 2);
        assert_eq!(cache.lru_offsets()[0], 0, "unpinned view is hottest");
        cache.release(a.id, a.epoch);
    }

    #[test]
    fn test_double_pin_is_error() {
        let (_host, mut cache) = setup(2);
        let a = cache.map_with(0, |_| 0).unwrap();
        let pinned = cache.pin(a.id).unwrap();
        assert!(matches!(
            cache.pin(a.id),
            Err(ViewError::AlreadyPinned { offset: 0 })
        ));
        cache.release(a.id, a.epoch);
        cache.unpin(pinned, true).unwrap();
    }

    #[test]
    fn test_write_outside_view_is_rejected() {
        let (_host, mut cache) = setup(2);
        let a = cache.map_with(0, |_| 0).unwrap();
        cache.release(a.id, a.epoch);
        let pinned = cache.pin(a.id).unwrap();
        assert!(cache.write_pinned(&pinned, 4094, b"xyz").is_err());
        cache.unpin(pinned, true).unwrap();
    }
}
