//! Per-file view set with LRU eviction.
//!
//! Views that are not pinned sit in one LRU list (hot end first), whether or
//! not they currently hold a mapping; an unmapped member is an idle slot ready
//! for reuse. Pinned views live only in the pinned set. The resident count
//! (LRU members plus pinned views) is held to `max_views`, and is allowed to
//! go one over while every resident view is referenced.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hivemap_config::{log_view_debug, log_view_trace, log_view_warn, HostConfig, ViewConfig};
use hivemap_slab::{List, Slab};
use tracing::warn;

use crate::error::{HostError, Result, ViewError};
use crate::host::{CacheManager, FileId, MappedPtr};
use crate::view::{View, ViewId, ViewInfo, ViewState};

/// A view handed out by [`ViewCache::map_with`] with its use count raised.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Acquired {
    pub id: ViewId,
    pub epoch: u64,
    pub address: MappedPtr,
    pub offset: u64,
    pub len: u32,
}

/// Point-in-time counters for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Views in the LRU list currently holding a mapping
    pub mapped: usize,
    pub pinned: usize,
    /// LRU members plus pinned views
    pub resident: usize,
    pub max_views: u32,
    pub hits: u64,
    pub maps: u64,
    pub evictions: u64,
    pub sweeps: u64,
    pub over_cap: u64,
    pub reclaimed: u64,
    pub pins: u64,
    pub unpins: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub hits: u64,
    pub maps: u64,
    pub evictions: u64,
    pub sweeps: u64,
    pub over_cap: u64,
    pub reclaimed: u64,
    pub pins: u64,
    pub unpins: u64,
}

pub struct ViewCache {
    pub(crate) file: FileId,
    pub(crate) host: Arc<dyn CacheManager>,
    pub(crate) views: Slab<View>,
    pub(crate) lru: List<ViewId>,
    pub(crate) pinned: HashSet<ViewId>,
    /// page index -> view mapping that page
    page_owner: HashMap<u64, ViewId>,
    file_len: u64,
    view_size: u32,
    page_size: u32,
    max_views: u32,
    pub(crate) flush_on_unpin: bool,
    /// Bumped by `recover_use_counts`; releases from older epochs are ignored.
    epoch: u64,
    closed: bool,
    pub(crate) counters: Counters,
}

impl ViewCache {
    pub fn new(
        file: FileId,
        host: Arc<dyn CacheManager>,
        file_len: u64,
        views: &ViewConfig,
        host_cfg: &HostConfig,
    ) -> Self {
        debug_assert!(
            views.view_size.is_power_of_two() && views.page_size.is_power_of_two(),
            "view_size {} and page_size {} must be powers of two",
            views.view_size,
            views.page_size
        );
        Self {
            file,
            host,
            views: Slab::new(),
            lru: List::new(),
            pinned: HashSet::new(),
            page_owner: HashMap::new(),
            file_len,
            view_size: views.view_size,
            page_size: views.page_size,
            max_views: views.max_views_per_file,
            flush_on_unpin: host_cfg.flush_on_unpin,
            epoch: 0,
            closed: false,
            counters: Counters::default(),
        }
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn max_views(&self) -> u32 {
        self.max_views
    }

    /// Views in the LRU list that hold a mapping.
    pub fn mapped_count(&self) -> usize {
        self.lru
            .iter()
            .filter(|(_, id)| self.views[**id].state == ViewState::Mapped)
            .count()
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned.len()
    }

    pub(crate) fn resident(&self) -> usize {
        self.lru.len() + self.pinned.len()
    }

    pub(crate) fn over_cap(&self) -> bool {
        self.resident() > self.max_views as usize
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            mapped: self.mapped_count(),
            pinned: self.pinned.len(),
            resident: self.resident(),
            max_views: self.max_views,
            hits: c.hits,
            maps: c.maps,
            evictions: c.evictions,
            sweeps: c.sweeps,
            over_cap: c.over_cap,
            reclaimed: c.reclaimed,
            pins: c.pins,
            unpins: c.unpins,
        }
    }

    /// The view currently mapping `offset`, if any.
    pub fn lookup(&self, offset: u64) -> Option<ViewId> {
        let id = *self.page_owner.get(&(offset / u64::from(self.page_size)))?;
        debug_assert!(self.views[id].covers(offset));
        Some(id)
    }

    pub fn view_info(&self, id: ViewId) -> Option<ViewInfo> {
        self.views.get(id).map(View::info)
    }

    pub fn view_at(&self, offset: u64) -> Option<ViewInfo> {
        self.lookup(offset).and_then(|id| self.view_info(id))
    }

    /// Offsets of mapped LRU members, hottest first.
    pub fn lru_offsets(&self) -> Vec<u64> {
        self.lru
            .iter()
            .map(|(_, id)| &self.views[*id])
            .filter(|v| v.state == ViewState::Mapped)
            .map(|v| v.file_offset)
            .collect()
    }

    /// Returns the view covering `offset` with its use count raised, mapping it
    /// in if needed. On resource exhaustion `sweep` is called once to free
    /// unused views (here and elsewhere) before the single retry.
    pub(crate) fn map_with<F>(&mut self, offset: u64, sweep: F) -> Result<Acquired>
    where
        F: FnOnce(&mut ViewCache) -> usize,
    {
        if self.closed {
            return Err(ViewError::FileClosed { file: self.file });
        }
        if offset >= self.file_len {
            return Err(ViewError::OffsetOutOfRange {
                offset,
                file_len: self.file_len,
            });
        }

        if let Some(id) = self.lookup(offset) {
            self.views[id].use_count += 1;
            self.touch(id);
            self.counters.hits += 1;
            return Ok(self.acquired(id));
        }

        let base = offset & !(u64::from(self.view_size) - 1);
        let len = self.len_for(base, self.file_len);
        let id = self.select_victim();

        if self.views[id].state == ViewState::Mapped {
            log_view_trace!(
                "Evicting view",
                file = self.file.0,
                offset = self.views[id].file_offset
            );
            self.unmap_view(id, false);
            self.counters.evictions += 1;
        }

        let mapping = match self.host.map(self.file, base, len) {
            Ok(mapping) => mapping,
            Err(err) if err.is_resource_exhaustion() => {
                log_view_warn!(
                    "Host out of mappings, sweeping unused views",
                    file = self.file.0,
                    offset = base
                );
                self.counters.sweeps += 1;
                let freed = sweep(self);
                log_view_debug!("Sweep finished", freed = freed);
                self.host
                    .map(self.file, base, len)
                    .map_err(|err| map_error(offset, err))?
            }
            Err(err) => return Err(map_error(offset, err)),
        };

        let view = &mut self.views[id];
        view.file_offset = base;
        view.length = len;
        view.address = Some(mapping.address);
        view.cache_handle = Some(mapping.handle);
        view.state = ViewState::Mapped;
        view.use_count = 1;
        let node = view.lru_node;
        view.check_invariants();

        for page in self.pages(base, len) {
            let previous = self.page_owner.insert(page, id);
            assert!(
                previous.is_none(),
                "page {page} of {} already owned by another view",
                self.file
            );
        }
        if let Some(node) = node {
            self.lru.move_to_front(node);
        }
        self.counters.maps += 1;

        if self.over_cap() {
            self.reclaim_one(Some(id));
        }

        log_view_trace!("Mapped view", file = self.file.0, offset = base, len = len);
        Ok(self.acquired(id))
    }

    /// Moves a mapped, unpinned view to the hot end. No-op for pinned views.
    pub fn touch(&mut self, id: ViewId) {
        let Some(view) = self.views.get(id) else {
            return;
        };
        if view.state == ViewState::Pinned {
            return;
        }
        if let Some(node) = view.lru_node {
            if self.lru.front() != Some(node) {
                self.lru.move_to_front(node);
            }
        }
    }

    /// Drops one reference taken by `map_with`.
    pub(crate) fn release(&mut self, id: ViewId, epoch: u64) {
        if epoch != self.epoch {
            log_view_trace!("Ignoring release from before usage recovery");
            return;
        }
        let file = self.file;
        let Some(view) = self.views.get_mut(id) else {
            panic!("release of freed view {id:?} in {file}");
        };
        assert!(
            view.use_count > 0,
            "use count underflow on view at {:#x}",
            view.file_offset
        );
        view.use_count -= 1;
    }

    /// Unmaps every unreferenced, unpinned view without reordering the LRU.
    pub fn unmap_unused(&mut self) -> usize {
        let idle: Vec<ViewId> = self
            .lru
            .iter()
            .map(|(_, id)| *id)
            .filter(|id| {
                let v = &self.views[*id];
                v.state == ViewState::Mapped && v.use_count == 0
            })
            .collect();
        for id in &idle {
            self.unmap_view(*id, false);
        }
        idle.len()
    }

    /// Unmaps the view covering `offset` and parks it at the cold end.
    /// Returns false when nothing unpinned maps that offset.
    pub fn unmap_view_at(&mut self, offset: u64) -> Result<bool> {
        let Some(id) = self.lookup(offset) else {
            return Ok(false);
        };
        let view = &self.views[id];
        if view.state == ViewState::Pinned {
            return Ok(false);
        }
        if view.use_count > 0 {
            return Err(ViewError::ViewInUse {
                offset: view.file_offset,
            });
        }
        self.unmap_view(id, true);
        Ok(true)
    }

    /// Resizes the backing file. Views whose clamped length changes are
    /// unmapped so the next lookup maps the new extent. Their surviving bytes
    /// are flushed and the cut-off range purged before the host resizes, so no
    /// write-back lands past the new end.
    pub fn set_file_len(&mut self, new_len: u64) -> Result<()> {
        let mut stale = Vec::new();
        for (id, view) in self.views.iter() {
            if view.state == ViewState::Unmapped {
                continue;
            }
            if self.len_for(view.file_offset, new_len) == view.length {
                continue;
            }
            if view.use_count > 0 || view.state == ViewState::Pinned {
                return Err(ViewError::ViewInUse {
                    offset: view.file_offset,
                });
            }
            stale.push(id);
        }

        for &id in &stale {
            let (base, end) = (self.views[id].file_offset, self.views[id].end());
            if base < new_len {
                self.host
                    .flush(self.file, base, end.min(new_len) - base)
                    .map_err(|source| ViewError::HostIo { offset: base, source })?;
            }
        }
        if new_len < self.file_len {
            self.host.purge(self.file, new_len, self.file_len - new_len);
        }
        let unmapped = stale.len();
        for id in stale {
            self.unmap_view(id, true);
        }

        self.host
            .resize(self.file, new_len)
            .map_err(|source| ViewError::HostIo {
                offset: new_len,
                source,
            })?;
        log_view_debug!(
            "Resized file",
            file = self.file.0,
            old_len = self.file_len,
            new_len = new_len,
            unmapped = unmapped
        );
        self.file_len = new_len;
        Ok(())
    }

    /// Zeroes every use count and trims back under the cap. Only for recovery
    /// after references were leaked; outstanding references become inert.
    pub fn recover_use_counts(&mut self) {
        self.epoch += 1;
        let mut leaked = 0u64;
        let keys = self.views.keys();
        for id in keys {
            let view = &mut self.views[id];
            leaked += u64::from(view.use_count);
            view.use_count = 0;
        }
        while self.over_cap() && self.reclaim_one(None) {}
        if leaked > 0 {
            log_view_warn!(
                "Recovered leaked view references",
                file = self.file.0,
                leaked = leaked
            );
        }
    }

    /// Tears down every view and asks the host to drop and flush the file's
    /// cached data. Fails if any view is still referenced.
    pub fn destroy(&mut self) -> Result<()> {
        let in_use = self
            .views
            .iter()
            .filter(|(_, v)| v.use_count > 0)
            .count();
        if in_use > 0 {
            return Err(ViewError::FileBusy { in_use });
        }

        let pinned: Vec<ViewId> = self.pinned.drain().collect();
        for id in pinned {
            let node = self.lru.push_back(id);
            let view = &mut self.views[id];
            view.lru_node = Some(node);
            view.state = ViewState::Mapped;
        }

        let mut freed = 0usize;
        while let Some(id) = self.lru.pop_front() {
            self.views[id].lru_node = None;
            if self.views[id].state == ViewState::Mapped {
                self.unmap_view(id, false);
            }
            self.views.remove(id);
            freed += 1;
        }
        debug_assert!(self.views.is_empty());
        debug_assert!(self.page_owner.is_empty());

        self.host.purge(self.file, 0, self.file_len);
        if let Err(err) = self.host.flush(self.file, 0, self.file_len) {
            warn!(file = self.file.0, error = %err, "Final flush failed");
        }
        self.closed = true;
        log_view_debug!("Destroyed view list", file = self.file.0, freed = freed);
        Ok(())
    }

    fn acquired(&self, id: ViewId) -> Acquired {
        let view = &self.views[id];
        Acquired {
            id,
            epoch: self.epoch,
            address: view
                .address
                .unwrap_or_else(|| panic!("acquired unmapped view {id:?}")),
            offset: view.file_offset,
            len: view.length,
        }
    }

    fn select_victim(&mut self) -> ViewId {
        let Some(tail) = self.lru.back().and_then(|node| self.lru.get(node)).copied() else {
            return self.allocate();
        };
        if self.views[tail].state == ViewState::Unmapped {
            return tail;
        }
        if self.resident() < self.max_views as usize {
            return self.allocate();
        }
        if let Some(id) = self.first_unused_from_tail(None) {
            return id;
        }

        self.counters.over_cap += 1;
        log_view_warn!(
            "All views referenced, exceeding soft cap",
            file = self.file.0,
            resident = self.resident(),
            max_views = self.max_views
        );
        self.allocate()
    }

    fn allocate(&mut self) -> ViewId {
        let id = self.views.insert(View::unmapped());
        let node = self.lru.push_back(id);
        self.views[id].lru_node = Some(node);
        id
    }

    pub(crate) fn first_unused_from_tail(&self, skip: Option<ViewId>) -> Option<ViewId> {
        self.lru
            .iter_rev()
            .map(|(_, id)| *id)
            .find(|id| Some(*id) != skip && self.views[*id].use_count == 0)
    }

    /// Frees the coldest unreferenced LRU member other than `keep`.
    pub(crate) fn reclaim_one(&mut self, keep: Option<ViewId>) -> bool {
        let Some(id) = self.first_unused_from_tail(keep) else {
            return false;
        };
        if self.views[id].state == ViewState::Mapped {
            self.unmap_view(id, false);
        }
        if let Some(node) = self.views[id].lru_node.take() {
            self.lru.remove(node);
        }
        self.views.remove(id);
        self.counters.reclaimed += 1;
        true
    }

    /// Releases the host mapping of `id`. Panics if the view is referenced.
    pub(crate) fn unmap_view(&mut self, id: ViewId, move_to_tail: bool) {
        let view = &mut self.views[id];
        assert_eq!(
            view.use_count, 0,
            "unmapping view at {:#x} with live references",
            view.file_offset
        );
        let Some(handle) = view.cache_handle.take() else {
            return;
        };
        let (base, len) = (view.file_offset, view.length);
        view.address = None;
        view.state = ViewState::Unmapped;
        view.length = 0;
        let node = view.lru_node;

        let first = base / u64::from(self.page_size);
        for page in first..first + self.page_span(len) {
            self.page_owner.remove(&page);
        }
        self.host.unmap(handle);

        if move_to_tail {
            if let Some(node) = node {
                self.lru.move_to_back(node);
            }
        }
    }

    fn len_for(&self, base: u64, file_len: u64) -> u32 {
        if base >= file_len {
            return 0;
        }
        (file_len - base).min(u64::from(self.view_size)) as u32
    }

    fn page_span(&self, len: u32) -> u64 {
        u64::from(len).div_ceil(u64::from(self.page_size))
    }

    fn pages(&self, base: u64, len: u32) -> std::ops::Range<u64> {
        let first = base / u64::from(self.page_size);
        first..first + self.page_span(len)
    }
}

fn map_error(offset: u64, err: HostError) -> ViewError {
    if err.is_resource_exhaustion() {
        ViewError::OutOfResources { offset }
    } else {
        ViewError::HostIo {
            offset,
            source: err,
        }
    }
}
