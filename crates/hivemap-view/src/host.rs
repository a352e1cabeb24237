//! Boundary to the host page cache.
//!
//! The view cache never touches file bytes itself; it asks a [`CacheManager`]
//! to map, pin, dirty, flush and purge byte ranges. Two implementations ship
//! with the crate: [`MmapCacheManager`](crate::MmapCacheManager) over real
//! files and [`FakeCacheManager`](crate::testing::FakeCacheManager) for tests.

use std::fmt;
use std::path::Path;
use std::ptr::NonNull;

use crate::error::HostError;

/// Identifies one attached backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// Start of a mapped byte range. Owned by the host; the cache only borrows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer is an address inside a host mapping; access to the
// bytes is synchronized by the file and view locks, not by this type.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr()
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// The host's token for one mapping or pin of a range.
///
/// Not `Clone`: every handle goes back to the host exactly once, through
/// [`CacheManager::unmap`] or as the input of [`CacheManager::pin`].
#[derive(Debug, PartialEq, Eq)]
pub struct CacheHandle {
    file: FileId,
    offset: u64,
    len: u32,
    pinned: bool,
    token: u64,
}

impl CacheHandle {
    /// Minted by host implementations only.
    pub fn new(file: FileId, offset: u64, len: u32, pinned: bool, token: u64) -> Self {
        Self {
            file,
            offset,
            len,
            pinned,
            token,
        }
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Result of a successful [`CacheManager::map`].
#[derive(Debug)]
pub struct Mapping {
    pub handle: CacheHandle,
    pub address: MappedPtr,
}

/// Host page-cache primitives.
///
/// Contract relied on by the view cache: while any handle for a range is
/// outstanding, mapping the same range again returns the same address.
pub trait CacheManager: Send + Sync {
    /// Registers a backing file and returns its length in bytes.
    fn attach(&self, file: FileId, path: &Path) -> Result<u64, HostError>;

    /// Forgets a backing file. Every handle must already be released.
    fn detach(&self, file: FileId);

    /// Maps `[offset, offset + len)`. May block on I/O.
    fn map(&self, file: FileId, offset: u64, len: u32) -> Result<Mapping, HostError>;

    /// Releases a mapping or pin.
    fn unmap(&self, handle: CacheHandle);

    /// Upgrades a mapping to a pin. On failure the original handle comes back
    /// untouched so the caller's view stays mapped.
    fn pin(&self, handle: CacheHandle) -> Result<CacheHandle, (CacheHandle, HostError)>;

    /// Marks a pinned range as holding changes that must reach the file.
    fn mark_dirty(&self, handle: &CacheHandle);

    /// Writes dirty data in the range back to the file.
    fn flush(&self, file: FileId, offset: u64, len: u64) -> Result<(), HostError>;

    /// Drops unwritten changes in the range.
    fn purge(&self, file: FileId, offset: u64, len: u64);

    /// Changes the backing file length.
    fn resize(&self, file: FileId, len: u64) -> Result<(), HostError>;
}
