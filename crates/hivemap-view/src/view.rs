use hivemap_slab::{Key, NodeKey};

use crate::host::{CacheHandle, MappedPtr};

pub type ViewId = Key<View>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Unmapped,
    Mapped,
    Pinned,
}

/// One window of bytes over an aligned range of the backing file.
#[derive(Debug)]
pub struct View {
    pub(crate) file_offset: u64,
    pub(crate) length: u32,
    pub(crate) address: Option<MappedPtr>,
    pub(crate) use_count: u32,
    pub(crate) cache_handle: Option<CacheHandle>,
    pub(crate) state: ViewState,
    /// Position in the LRU list; `None` exactly when pinned.
    pub(crate) lru_node: Option<NodeKey<ViewId>>,
}

impl View {
    pub(crate) fn unmapped() -> Self {
        Self {
            file_offset: 0,
            length: 0,
            address: None,
            use_count: 0,
            cache_handle: None,
            state: ViewState::Unmapped,
            lru_node: None,
        }
    }

    pub(crate) fn covers(&self, offset: u64) -> bool {
        self.state != ViewState::Unmapped
            && offset >= self.file_offset
            && offset < self.file_offset + u64::from(self.length)
    }

    pub(crate) fn end(&self) -> u64 {
        self.file_offset + u64::from(self.length)
    }

    pub(crate) fn check_invariants(&self) {
        debug_assert_eq!(
            self.address.is_some(),
            self.state != ViewState::Unmapped,
            "address present iff mapped"
        );
        debug_assert_eq!(self.cache_handle.is_some(), self.address.is_some());
        debug_assert_eq!(
            self.lru_node.is_none(),
            self.state == ViewState::Pinned,
            "a view is in the LRU list iff it is not pinned"
        );
        debug_assert!(self.state != ViewState::Unmapped || self.use_count == 0);
    }

    pub(crate) fn info(&self) -> ViewInfo {
        ViewInfo {
            file_offset: self.file_offset,
            length: self.length,
            state: self.state,
            use_count: self.use_count,
            address: self.address.map(|a| a.as_ptr() as usize),
        }
    }
}

/// Snapshot of a view for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewInfo {
    pub file_offset: u64,
    pub length: u32,
    pub state: ViewState,
    pub use_count: u32,
    pub address: Option<usize>,
}
