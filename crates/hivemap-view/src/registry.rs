//! Process-wide set of open backing files.
//!
//! Each [`HiveFile`] owns two locks: the file lock (readers/writers) that
//! callers hold for any lookup, and the view-list mutex nested inside it that
//! guards the [`ViewCache`]. References to mapped bytes are [`ViewRef`]s,
//! borrowed from a file guard and released on drop.
//!
//! When the host runs out of mappings, the failing file sweeps unused views
//! in every open file. Files with a lower id are locked (blocking), files with
//! a higher id are only try-locked, so two sweeping threads never wait on each
//! other.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use hivemap_config::{log_view_debug, Config, HostConfig, ViewConfig};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, instrument};

use crate::cache::{CacheStats, ViewCache};
use crate::error::{Result, ViewError};
use crate::host::{CacheManager, FileId, MappedPtr};
use crate::pin::PinnedView;
use crate::view::{ViewId, ViewInfo};

struct RegistryInner {
    host: Arc<dyn CacheManager>,
    views: ViewConfig,
    host_cfg: HostConfig,
    files: DashMap<FileId, Arc<HiveFile>>,
    paths: DashMap<PathBuf, FileId>,
    next_id: AtomicU64,
}

/// Owns every open [`HiveFile`]. Cheap to clone.
#[derive(Clone)]
pub struct ViewCacheRegistry {
    inner: Arc<RegistryInner>,
}

impl ViewCacheRegistry {
    pub fn new(host: Arc<dyn CacheManager>, config: &Config) -> Self {
        Self::with_sections(host, config.views.clone(), config.host.clone())
    }

    pub fn with_sections(host: Arc<dyn CacheManager>, views: ViewConfig, host_cfg: HostConfig) -> Self {
        debug_assert!(
            views.view_size.is_power_of_two() && views.view_size >= views.page_size,
            "view_size {} must be a power of two no smaller than page_size {}",
            views.view_size,
            views.page_size
        );
        Self {
            inner: Arc::new(RegistryInner {
                host,
                views,
                host_cfg,
                files: DashMap::new(),
                paths: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn host(&self) -> &Arc<dyn CacheManager> {
        &self.inner.host
    }

    /// Opens `path` as a backing file. Opening an already loaded path returns
    /// the existing entry.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Arc<HiveFile>> {
        let path = normalize(path.as_ref());
        if let Some(existing) = self.lookup(&path) {
            return Ok(existing);
        }

        let id = FileId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let file_len = self
            .inner
            .host
            .attach(id, &path)
            .map_err(|source| ViewError::Attach {
                path: path.clone(),
                source,
            })?;

        let file = Arc::new(HiveFile {
            id,
            path: path.clone(),
            lock: RwLock::new(()),
            views: Mutex::new(ViewCache::new(
                id,
                self.inner.host.clone(),
                file_len,
                &self.inner.views,
                &self.inner.host_cfg,
            )),
            registry: Arc::downgrade(&self.inner),
        });

        // Lost a race with another opener of the same path: keep theirs.
        match self.inner.paths.entry(path.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                let winner = *e.get();
                drop(e);
                self.inner.host.detach(id);
                return self
                    .inner
                    .files
                    .get(&winner)
                    .map(|f| f.clone())
                    .ok_or(ViewError::FileNotLoaded(path));
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                self.inner.files.insert(id, file.clone());
                e.insert(id);
            }
        }

        info!(file = %id, path = %path.display(), len = file_len, "Opened backing file");
        Ok(file)
    }

    pub fn get(&self, id: FileId) -> Option<Arc<HiveFile>> {
        self.inner.files.get(&id).map(|f| f.clone())
    }

    pub fn lookup(&self, path: &Path) -> Option<Arc<HiveFile>> {
        let id = *self.inner.paths.get(&normalize(path))?;
        self.get(id)
    }

    pub fn is_file_loaded(&self, path: impl AsRef<Path>) -> bool {
        self.inner.paths.contains_key(&normalize(path.as_ref()))
    }

    pub fn file_ids(&self) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self.inner.files.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Closes a file: tears down its views, then detaches it from the host.
    /// Fails while any view is referenced.
    pub fn close(&self, id: FileId) -> Result<()> {
        let file = self
            .get(id)
            .ok_or_else(|| ViewError::FileNotLoaded(PathBuf::from(id.to_string())))?;
        {
            let _exclusive = file.lock.write();
            file.views.lock().destroy()?;
        }
        self.inner.files.remove(&id);
        self.inner.paths.remove(&file.path);
        self.inner.host.detach(id);
        info!(file = %id, path = %file.path.display(), "Closed backing file");
        Ok(())
    }

    /// Unmaps unused views in every open file. Returns how many were unmapped.
    pub fn unmap_unused_all(&self) -> usize {
        self.inner.sweep(None)
    }
}

impl RegistryInner {
    fn sweep(&self, current: Option<FileId>) -> usize {
        let files: Vec<Arc<HiveFile>> = self.files.iter().map(|e| e.value().clone()).collect();
        let mut unmapped = 0;
        let mut skipped = 0;
        for file in files {
            if Some(file.id) == current {
                continue;
            }
            let guard = match current {
                Some(cur) if file.id > cur => file.views.try_lock(),
                _ => Some(file.views.lock()),
            };
            match guard {
                Some(mut cache) => unmapped += cache.unmap_unused(),
                None => skipped += 1,
            }
        }
        log_view_debug!("Global sweep", unmapped = unmapped, skipped = skipped);
        unmapped
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// One open backing file and its view cache.
pub struct HiveFile {
    id: FileId,
    path: PathBuf,
    lock: RwLock<()>,
    views: Mutex<ViewCache>,
    registry: Weak<RegistryInner>,
}

impl fmt::Debug for HiveFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiveFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl HiveFile {
    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.views.lock().file_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.views.lock().is_closed()
    }

    pub fn stats(&self) -> CacheStats {
        self.views.lock().stats()
    }

    pub fn view_at(&self, offset: u64) -> Option<ViewInfo> {
        self.views.lock().view_at(offset)
    }

    pub fn lru_offsets(&self) -> Vec<u64> {
        self.views.lock().lru_offsets()
    }

    /// Takes the file lock shared: lookups only.
    pub fn lock_shared(&self) -> SharedFileGuard<'_> {
        SharedFileGuard {
            file: self,
            _lock: self.lock.read(),
        }
    }

    /// Takes the file lock exclusively: lookups, pinning and writes.
    pub fn lock_exclusive(&self) -> ExclusiveFileGuard<'_> {
        ExclusiveFileGuard {
            file: self,
            _lock: self.lock.write(),
        }
    }

    fn cache(&self) -> MutexGuard<'_, ViewCache> {
        self.views.lock()
    }

    #[instrument(skip(self), fields(file = %self.id), level = "debug")]
    fn map_view(&self, offset: u64) -> Result<ViewRef<'_>> {
        let registry = self.registry.upgrade();
        let acquired = self.cache().map_with(offset, |cache| {
            let mut freed = cache.unmap_unused();
            if let Some(registry) = &registry {
                freed += registry.sweep(Some(self.id));
            }
            freed
        })?;
        Ok(ViewRef {
            file: self,
            id: acquired.id,
            epoch: acquired.epoch,
            address: acquired.address,
            offset: acquired.offset,
            len: acquired.len,
        })
    }
}

/// File lock held shared.
pub struct SharedFileGuard<'a> {
    file: &'a HiveFile,
    _lock: RwLockReadGuard<'a, ()>,
}

impl SharedFileGuard<'_> {
    pub fn file(&self) -> &HiveFile {
        self.file
    }

    /// References the view covering `offset`, mapping it in if needed.
    pub fn map(&self, offset: u64) -> Result<ViewRef<'_>> {
        self.file.map_view(offset)
    }
}

/// File lock held exclusively.
pub struct ExclusiveFileGuard<'a> {
    file: &'a HiveFile,
    _lock: RwLockWriteGuard<'a, ()>,
}

impl ExclusiveFileGuard<'_> {
    pub fn file(&self) -> &HiveFile {
        self.file
    }

    pub fn map(&self, offset: u64) -> Result<ViewRef<'_>> {
        self.file.map_view(offset)
    }

    /// Pins the view behind `view`.
    #[instrument(skip(self, view), fields(file = %self.file.id, offset = view.offset), level = "debug")]
    pub fn pin(&self, view: &ViewRef<'_>) -> Result<PinnedView> {
        self.file.cache().pin(view.id)
    }

    /// Maps and pins the view covering `offset` in one step.
    #[instrument(skip(self), fields(file = %self.file.id), level = "debug")]
    pub fn pin_at(&self, offset: u64) -> Result<PinnedView> {
        let view = self.map(offset)?;
        self.pin(&view)
    }

    /// Writes into a pinned view. Needs `&mut self` so no [`ViewRef`] from
    /// this guard can be reading the same bytes.
    pub fn write(&mut self, pinned: &PinnedView, at: u64, data: &[u8]) -> Result<()> {
        self.file.cache().write_pinned(pinned, at, data)
    }

    pub fn unpin(&mut self, pinned: PinnedView, discard_changes: bool) -> Result<()> {
        self.file.cache().unpin(pinned, discard_changes)
    }

    pub fn unmap_view_at(&mut self, offset: u64) -> Result<bool> {
        self.file.cache().unmap_view_at(offset)
    }

    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.cache().set_file_len(len)
    }

    /// See [`ViewCache::recover_use_counts`].
    pub fn recover_use_counts(&mut self) {
        self.file.cache().recover_use_counts()
    }
}

/// A counted reference to a mapped view. The bytes stay mapped at the same
/// address until it is dropped.
pub struct ViewRef<'a> {
    file: &'a HiveFile,
    id: ViewId,
    epoch: u64,
    address: MappedPtr,
    offset: u64,
    len: u32,
}

impl ViewRef<'_> {
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// File offset of the first byte of the view.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn address(&self) -> usize {
        self.address.as_ptr() as usize
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the use count taken for this reference keeps the range
        // mapped; writers need the exclusive file lock and `&mut` guard.
        unsafe { std::slice::from_raw_parts(self.address.as_ptr(), self.len as usize) }
    }

    /// Bytes at absolute file offset `at`, if they fall inside this view.
    pub fn slice_at(&self, at: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(at.checked_sub(self.offset)?).ok()?;
        self.bytes().get(start..start.checked_add(len)?)
    }
}

impl fmt::Debug for ViewRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewRef")
            .field("file", &self.file.id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for ViewRef<'_> {
    fn drop(&mut self) {
        self.file.cache().release(self.id, self.epoch);
    }
}
