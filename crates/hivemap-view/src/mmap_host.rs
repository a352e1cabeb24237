//! memmap2-backed cache manager.
//!
//! Ranges are mapped copy-on-write (`map_copy`), so the process is the only
//! writer of the bytes it sees: writes through a pinned view stay private until
//! `flush` copies dirty ranges back into the file, and `purge` simply forgets
//! them. While a range has outstanding handles every map of it returns the
//! same address.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use hivemap_config::{log_host_debug, log_host_error, HostConfig};
use memmap2::{MmapMut, MmapOptions};

use crate::error::HostError;
use crate::host::{CacheHandle, CacheManager, FileId, MappedPtr, Mapping};

struct MappedRange {
    map: MmapMut,
    refs: u32,
    dirty: bool,
}

struct MappedFile {
    path: PathBuf,
    file: File,
    ranges: HashMap<u64, MappedRange>,
}

pub struct MmapCacheManager {
    files: DashMap<FileId, MappedFile>,
    live_ranges: AtomicUsize,
    max_mappings: Option<usize>,
    next_token: AtomicU64,
}

impl MmapCacheManager {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            files: DashMap::new(),
            live_ranges: AtomicUsize::new(0),
            max_mappings: config.max_mappings,
            next_token: AtomicU64::new(1),
        }
    }

    /// Distinct ranges currently mapped across all files.
    pub fn live_ranges(&self) -> usize {
        self.live_ranges.load(Ordering::Relaxed)
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn reserve_range(&self) -> Result<(), HostError> {
        let Some(max) = self.max_mappings else {
            self.live_ranges.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        self.live_ranges
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| HostError::Busy)
    }
}

fn write_back(file: &File, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(bytes)
}

fn overlaps(start: u64, len: usize, offset: u64, span: u64) -> bool {
    start < offset.saturating_add(span) && offset < start + len as u64
}

fn not_attached(file: FileId) -> HostError {
    HostError::Rejected(format!("{file} is not attached"))
}

impl CacheManager for MmapCacheManager {
    fn attach(&self, file: FileId, path: &Path) -> Result<u64, HostError> {
        let handle = OpenOptions::new().read(true).write(true).open(path)?;
        let len = handle.metadata()?.len();
        if self.files.contains_key(&file) {
            return Err(HostError::Rejected(format!("{file} already attached")));
        }
        self.files.insert(
            file,
            MappedFile {
                path: path.to_path_buf(),
                file: handle,
                ranges: HashMap::new(),
            },
        );
        log_host_debug!("Attached backing file", file = file.0, len = len);
        Ok(len)
    }

    fn detach(&self, file: FileId) {
        let Some((_, mapped)) = self.files.remove(&file) else {
            return;
        };
        for (offset, range) in &mapped.ranges {
            if range.dirty {
                if let Err(err) = write_back(&mapped.file, *offset, &range.map) {
                    log_host_error!(
                        "Lost dirty range on detach",
                        path = tracing::field::display(mapped.path.display()),
                        offset = *offset,
                        error = tracing::field::display(&err)
                    );
                }
            }
        }
        self.live_ranges
            .fetch_sub(mapped.ranges.len(), Ordering::Relaxed);
    }

    fn map(&self, file: FileId, offset: u64, len: u32) -> Result<Mapping, HostError> {
        let mut entry = self.files.get_mut(&file).ok_or_else(|| not_attached(file))?;
        let MappedFile { file: backing, ranges, .. } = &mut *entry;

        if let Some(range) = ranges.get_mut(&offset) {
            if range.map.len() != len as usize {
                return Err(HostError::Rejected(format!(
                    "range {offset:#x} is mapped with length {}",
                    range.map.len()
                )));
            }
            range.refs += 1;
        } else {
            self.reserve_range()?;
            // SAFETY: private copy-on-write mapping; the file is only written
            // through `write_back`, never truncated below a live range.
            let mapped = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(len as usize)
                    .map_copy(&*backing)
            };
            let map = match mapped {
                Ok(map) => map,
                Err(err) => {
                    self.live_ranges.fetch_sub(1, Ordering::Relaxed);
                    return Err(HostError::Io(err));
                }
            };
            ranges.insert(
                offset,
                MappedRange {
                    map,
                    refs: 1,
                    dirty: false,
                },
            );
        }

        let range = ranges.get_mut(&offset).ok_or_else(|| not_attached(file))?;
        let address = NonNull::new(range.map.as_mut_ptr())
            .map(MappedPtr::new)
            .ok_or_else(|| HostError::Rejected("mapping returned null".into()))?;
        Ok(Mapping {
            handle: CacheHandle::new(file, offset, len, false, self.token()),
            address,
        })
    }

    fn unmap(&self, handle: CacheHandle) {
        let Some(mut entry) = self.files.get_mut(&handle.file()) else {
            return;
        };
        let MappedFile { file, ranges, path } = &mut *entry;
        let offset = handle.offset();
        let Some(range) = ranges.get_mut(&offset) else {
            log_host_error!("Unmap of unknown range", file = handle.file().0, offset = offset);
            return;
        };
        range.refs -= 1;
        if range.refs > 0 {
            return;
        }
        if let Some(range) = ranges.remove(&offset) {
            if range.dirty {
                if let Err(err) = write_back(file, offset, &range.map) {
                    log_host_error!(
                        "Write back on unmap failed",
                        path = tracing::field::display(path.display()),
                        offset = offset,
                        error = tracing::field::display(&err)
                    );
                }
            }
            self.live_ranges.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn pin(&self, handle: CacheHandle) -> Result<CacheHandle, (CacheHandle, HostError)> {
        let known = self
            .files
            .get(&handle.file())
            .is_some_and(|f| f.ranges.contains_key(&handle.offset()));
        if !known {
            let err = HostError::Rejected(format!("range {:#x} is not mapped", handle.offset()));
            return Err((handle, err));
        }
        Ok(CacheHandle::new(
            handle.file(),
            handle.offset(),
            handle.len(),
            true,
            self.token(),
        ))
    }

    fn mark_dirty(&self, handle: &CacheHandle) {
        if let Some(mut entry) = self.files.get_mut(&handle.file()) {
            if let Some(range) = entry.ranges.get_mut(&handle.offset()) {
                range.dirty = true;
            }
        }
    }

    fn flush(&self, file: FileId, offset: u64, len: u64) -> Result<(), HostError> {
        let Some(mut entry) = self.files.get_mut(&file) else {
            return Ok(());
        };
        let MappedFile { file: backing, ranges, .. } = &mut *entry;
        let mut wrote = false;
        for (start, range) in ranges.iter_mut() {
            if range.dirty && overlaps(*start, range.map.len(), offset, len) {
                write_back(backing, *start, &range.map)?;
                range.dirty = false;
                wrote = true;
            }
        }
        if wrote {
            backing.sync_data()?;
        }
        Ok(())
    }

    fn purge(&self, file: FileId, offset: u64, len: u64) {
        if let Some(mut entry) = self.files.get_mut(&file) {
            for (start, range) in entry.ranges.iter_mut() {
                if overlaps(*start, range.map.len(), offset, len) {
                    range.dirty = false;
                }
            }
        }
    }

    fn resize(&self, file: FileId, len: u64) -> Result<(), HostError> {
        let entry = self.files.get(&file).ok_or_else(|| not_attached(file))?;
        entry.file.set_len(len)?;
        Ok(())
    }
}
