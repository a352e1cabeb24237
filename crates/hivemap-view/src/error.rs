use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::host::FileId;

/// Errors reported by a [`CacheManager`](crate::CacheManager) implementation.
#[derive(Error, Debug)]
pub enum HostError {
    /// Out of mapping resources; the caller may free views and retry.
    #[error("host cache manager is out of mapping resources")]
    Busy,

    #[error("host I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("host rejected request: {0}")]
    Rejected(String),
}

impl HostError {
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, HostError::Busy)
    }
}

/// Errors that can occur during view cache operations
#[derive(Error, Debug)]
pub enum ViewError {
    #[error("out of view resources mapping offset {offset:#x}")]
    OutOfResources { offset: u64 },

    #[error("host I/O failure mapping offset {offset:#x}: {source}")]
    HostIo {
        offset: u64,
        #[source]
        source: HostError,
    },

    #[error("pinning view at {offset:#x} failed: {source}")]
    PinFailed {
        offset: u64,
        #[source]
        source: HostError,
    },

    #[error("view at {offset:#x} is already pinned")]
    AlreadyPinned { offset: u64 },

    #[error("offset {offset:#x} is beyond end of file ({file_len:#x})")]
    OffsetOutOfRange { offset: u64, file_len: u64 },

    #[error("view at {offset:#x} is still referenced")]
    ViewInUse { offset: u64 },

    #[error("view handle no longer names a live view")]
    StaleView,

    #[error("file still has {in_use} referenced views")]
    FileBusy { in_use: usize },

    #[error("file is not loaded: {0}")]
    FileNotLoaded(PathBuf),

    #[error("{file} has been closed")]
    FileClosed { file: FileId },

    #[error("failed to attach {path}: {source}")]
    Attach {
        path: PathBuf,
        #[source]
        source: HostError,
    },
}

impl ViewError {
    /// True for the resource class of failures. These leave the cache
    /// consistent and the operation may be retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ViewError::OutOfResources { .. } | ViewError::HostIo { .. } => true,
            ViewError::PinFailed { source, .. } => source.is_resource_exhaustion(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ViewError>;
