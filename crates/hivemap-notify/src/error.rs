//! Error types for the notification hub

use thiserror::Error;

use crate::keyspace::{HiveId, KeyId};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("invalid change filter {0:#x}")]
    InvalidFilter(u32),

    #[error("key {0} has been deleted")]
    KeyDeleted(KeyId),

    #[error("key handle is closed")]
    HandleClosed,

    #[error("secondary key lives in the same file ({0}) as the primary")]
    SameFile(HiveId),

    #[error("work-item watches cannot name a secondary key")]
    LinkedWorkItem,

    #[error("delivery host refused the request: {0}")]
    Enqueue(String),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            NotifyError::InvalidFilter(0x40).to_string(),
            "invalid change filter 0x40"
        );
        assert!(NotifyError::SameFile(HiveId(2)).to_string().contains("hive#2"));
        assert!(NotifyError::KeyDeleted(KeyId(9)).to_string().contains("key#9"));
    }
}
