//! # hivemap-view
//!
//! Bounded memory-view cache over backing files.
//!
//! A backing file is accessed through fixed-size, aligned *views*: mapped
//! windows obtained from a host [`CacheManager`]. Each file keeps at most
//! `max_views_per_file` views resident, recycling the least recently used
//! unreferenced one when a new range is needed. Views can be *pinned* for
//! writing; pinned views never move and are never evicted until unpinned.
//!
//! ```text
//! ViewCacheRegistry ──► HiveFile (file lock)
//!                         └── Mutex<ViewCache>
//!                               ├── Slab<View>
//!                               ├── LRU list (hot → cold)
//!                               └── pinned set
//! ```
//!
//! Callers take the file lock through [`HiveFile::lock_shared`] or
//! [`HiveFile::lock_exclusive`] and borrow [`ViewRef`]s from the guard. A view
//! stays mapped at the same address while any reference to it is alive.

mod cache;
mod error;
mod host;
mod mmap_host;
mod pin;
mod registry;
pub mod testing;
mod view;

pub use cache::{CacheStats, ViewCache};
pub use error::{HostError, Result, ViewError};
pub use host::{CacheHandle, CacheManager, FileId, MappedPtr, Mapping};
pub use mmap_host::MmapCacheManager;
pub use pin::PinnedView;
pub use registry::{ExclusiveFileGuard, HiveFile, SharedFileGuard, ViewCacheRegistry, ViewRef};
pub use view::{ViewId, ViewInfo, ViewState};
