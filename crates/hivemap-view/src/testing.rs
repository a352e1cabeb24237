//! Test doubles for the host cache manager.
//!
//! [`FakeCacheManager`] keeps file contents in memory and hands out private
//! copies of mapped ranges, mirroring the copy-on-write behaviour of the real
//! host: changes reach the "file" only through `flush` (or the last unmap of a
//! dirty range). It counts every call, can inject `Busy` and I/O map results
//! and pin failures, and panics when a handle is released twice or a file is detached
//! with mappings still live.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::HostError;
use crate::host::{CacheHandle, CacheManager, FileId, MappedPtr, Mapping};

/// Call counters of a [`FakeCacheManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeCounters {
    pub map_calls: u64,
    /// Maps that created a new address (range was not already mapped)
    pub fresh_maps: u64,
    pub unmaps: u64,
    pub pins: u64,
    pub failed_pins: u64,
    pub dirty_marks: u64,
    pub flushes: u64,
    pub purges: u64,
    pub busy_returned: u64,
}

struct FakeRange {
    buf: Box<[u8]>,
    refs: u32,
    dirty: bool,
}

struct FakeFile {
    content: Vec<u8>,
    ranges: HashMap<u64, FakeRange>,
}

#[derive(Default)]
struct FakeState {
    registered: HashMap<PathBuf, u64>,
    files: HashMap<FileId, FakeFile>,
    live: HashSet<u64>,
    next_token: u64,
    busy_maps: u32,
    failing_maps: u32,
    failing_pins: u32,
    max_live_ranges: Option<usize>,
    counters: FakeCounters,
}

impl FakeState {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.live.insert(self.next_token);
        self.next_token
    }

    fn live_ranges(&self) -> usize {
        self.files.values().map(|f| f.ranges.len()).sum()
    }
}

#[derive(Default)]
pub struct FakeCacheManager {
    state: Mutex<FakeState>,
}

impl FakeCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `path` attachable with `len` bytes of patterned content.
    pub fn register_file(&self, path: &Path, len: u64) {
        self.state.lock().registered.insert(path.to_path_buf(), len);
    }

    /// The next `n` maps of a fresh range report resource exhaustion.
    pub fn busy_next_maps(&self, n: u32) {
        self.state.lock().busy_maps = n;
    }

    /// The next `n` maps fail with an I/O error, even of ranges already mapped.
    pub fn fail_next_maps(&self, n: u32) {
        self.state.lock().failing_maps = n;
    }

    /// The next `n` pins fail.
    pub fn fail_next_pins(&self, n: u32) {
        self.state.lock().failing_pins = n;
    }

    /// Caps distinct mapped ranges across all files; beyond it maps are `Busy`.
    pub fn set_max_live_ranges(&self, max: Option<usize>) {
        self.state.lock().max_live_ranges = max;
    }

    pub fn counters(&self) -> FakeCounters {
        self.state.lock().counters
    }

    /// Handles not yet returned to the host.
    pub fn live_handles(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_ranges(&self) -> usize {
        self.state.lock().live_ranges()
    }

    /// Flushed content of an attached file.
    pub fn file_bytes(&self, file: FileId) -> Vec<u8> {
        self.state
            .lock()
            .files
            .get(&file)
            .map(|f| f.content.clone())
            .unwrap_or_default()
    }

    pub fn file_len(&self, file: FileId) -> Option<u64> {
        self.state
            .lock()
            .files
            .get(&file)
            .map(|f| f.content.len() as u64)
    }

    pub fn is_dirty(&self, file: FileId, offset: u64) -> bool {
        self.state
            .lock()
            .files
            .get(&file)
            .and_then(|f| f.ranges.get(&offset))
            .is_some_and(|r| r.dirty)
    }
}

fn overlaps(start: u64, len: usize, offset: u64, span: u64) -> bool {
    start < offset.saturating_add(span) && offset < start + len as u64
}

impl CacheManager for FakeCacheManager {
    fn attach(&self, file: FileId, path: &Path) -> Result<u64, HostError> {
        let mut state = self.state.lock();
        let len = *state.registered.get(path).ok_or_else(|| {
            HostError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not registered", path.display()),
            ))
        })?;
        let content = (0..len).map(hivemap_config::testing::pattern_byte).collect();
        state.files.insert(
            file,
            FakeFile {
                content,
                ranges: HashMap::new(),
            },
        );
        Ok(len)
    }

    fn detach(&self, file: FileId) {
        let mut state = self.state.lock();
        if let Some(f) = state.files.remove(&file) {
            assert!(
                f.ranges.is_empty(),
                "{file} detached with {} live ranges",
                f.ranges.len()
            );
        }
    }

    fn map(&self, file: FileId, offset: u64, len: u32) -> Result<Mapping, HostError> {
        let mut state = self.state.lock();
        state.counters.map_calls += 1;
        if state.failing_maps > 0 {
            state.failing_maps -= 1;
            return Err(HostError::Io(std::io::Error::other("injected map failure")));
        }

        let already = state
            .files
            .get(&file)
            .ok_or_else(|| HostError::Rejected(format!("{file} not attached")))?
            .ranges
            .contains_key(&offset);

        if !already {
            if state.busy_maps > 0 {
                state.busy_maps -= 1;
                state.counters.busy_returned += 1;
                return Err(HostError::Busy);
            }
            if let Some(max) = state.max_live_ranges {
                if state.live_ranges() >= max {
                    state.counters.busy_returned += 1;
                    return Err(HostError::Busy);
                }
            }
            state.counters.fresh_maps += 1;
        }

        let token = state.token();
        let FakeFile { content, ranges } = state
            .files
            .get_mut(&file)
            .ok_or_else(|| HostError::Rejected(format!("{file} not attached")))?;
        let range = ranges.entry(offset).or_insert_with(|| {
            let mut buf = vec![0u8; len as usize].into_boxed_slice();
            let start = (offset as usize).min(content.len());
            let end = (offset as usize + len as usize).min(content.len());
            buf[..end - start].copy_from_slice(&content[start..end]);
            FakeRange {
                buf,
                refs: 0,
                dirty: false,
            }
        });
        assert_eq!(range.buf.len(), len as usize, "range remapped with a different length");
        range.refs += 1;
        let address = MappedPtr::new(
            NonNull::new(range.buf.as_mut_ptr()).ok_or(HostError::Rejected("null buffer".into()))?,
        );
        Ok(Mapping {
            handle: CacheHandle::new(file, offset, len, false, token),
            address,
        })
    }

    fn unmap(&self, handle: CacheHandle) {
        let mut state = self.state.lock();
        assert!(
            state.live.remove(&handle.token()),
            "handle {} released twice",
            handle.token()
        );
        state.counters.unmaps += 1;
        let Some(f) = state.files.get_mut(&handle.file()) else {
            return;
        };
        let Some(range) = f.ranges.get_mut(&handle.offset()) else {
            panic!("unmap of unknown range {:#x}", handle.offset());
        };
        range.refs -= 1;
        if range.refs == 0 {
            if let Some(range) = f.ranges.remove(&handle.offset()) {
                if range.dirty {
                    let start = handle.offset() as usize;
                    let end = (start + range.buf.len()).min(f.content.len());
                    f.content[start..end].copy_from_slice(&range.buf[..end - start]);
                }
            }
        }
    }

    fn pin(&self, handle: CacheHandle) -> Result<CacheHandle, (CacheHandle, HostError)> {
        let mut state = self.state.lock();
        if state.failing_pins > 0 {
            state.failing_pins -= 1;
            state.counters.failed_pins += 1;
            return Err((handle, HostError::Rejected("injected pin failure".into())));
        }
        assert!(
            state.live.remove(&handle.token()),
            "pin of released handle {}",
            handle.token()
        );
        state.counters.pins += 1;
        let token = state.token();
        Ok(CacheHandle::new(
            handle.file(),
            handle.offset(),
            handle.len(),
            true,
            token,
        ))
    }

    fn mark_dirty(&self, handle: &CacheHandle) {
        let mut state = self.state.lock();
        state.counters.dirty_marks += 1;
        if let Some(range) = state
            .files
            .get_mut(&handle.file())
            .and_then(|f| f.ranges.get_mut(&handle.offset()))
        {
            range.dirty = true;
        }
    }

    fn flush(&self, file: FileId, offset: u64, len: u64) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.counters.flushes += 1;
        let Some(f) = state.files.get_mut(&file) else {
            return Ok(());
        };
        let FakeFile { content, ranges } = f;
        for (start, range) in ranges.iter_mut() {
            if range.dirty && overlaps(*start, range.buf.len(), offset, len) {
                let s = *start as usize;
                let e = (s + range.buf.len()).min(content.len());
                content[s..e].copy_from_slice(&range.buf[..e - s]);
                range.dirty = false;
            }
        }
        Ok(())
    }

    fn purge(&self, file: FileId, offset: u64, len: u64) {
        let mut state = self.state.lock();
        state.counters.purges += 1;
        if let Some(f) = state.files.get_mut(&file) {
            for (start, range) in f.ranges.iter_mut() {
                if overlaps(*start, range.buf.len(), offset, len) {
                    range.dirty = false;
                }
            }
        }
    }

    fn resize(&self, file: FileId, len: u64) -> Result<(), HostError> {
        let mut state = self.state.lock();
        let f = state
            .files
            .get_mut(&file)
            .ok_or_else(|| HostError::Rejected(format!("{file} not attached")))?;
        f.content.resize(len as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_range_same_address() {
        let host = FakeCacheManager::new();
        host.register_file(Path::new("/f"), 8192);
        host.attach(FileId(1), Path::new("/f")).unwrap();

        let a = host.map(FileId(1), 0, 4096).unwrap();
        let b = host.map(FileId(1), 0, 4096).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(host.counters().fresh_maps, 1);
        host.unmap(a.handle);
        host.unmap(b.handle);
        assert_eq!(host.live_handles(), 0);
        assert_eq!(host.live_ranges(), 0);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_unmap_panics() {
        let host = FakeCacheManager::new();
        host.register_file(Path::new("/f"), 4096);
        host.attach(FileId(1), Path::new("/f")).unwrap();
        let a = host.map(FileId(1), 0, 4096).unwrap();
        let forged = CacheHandle::new(FileId(1), 0, 4096, false, a.handle.token());
        host.unmap(a.handle);
        host.unmap(forged);
    }

    #[test]
    fn test_unregistered_path_fails_attach() {
        let host = FakeCacheManager::new();
        assert!(matches!(
            host.attach(FileId(1), Path::new("/missing")),
            Err(HostError::Io(_))
        ));
    }
}
