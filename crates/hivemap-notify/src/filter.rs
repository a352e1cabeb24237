use bitflags::bitflags;

bitflags! {
    /// Change classes a subscription listens for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChangeFilter: u32 {
        /// A subkey was created or deleted
        const NAME = 0x1;
        const ATTRIBUTES = 0x2;
        /// A value was set or deleted
        const LAST_SET = 0x4;
        const SECURITY = 0x8;
    }
}

impl ChangeFilter {
    /// Legal, non-empty filters only.
    pub fn validate(bits: u32) -> Option<Self> {
        let filter = Self::from_bits(bits)?;
        (!filter.is_empty()).then_some(filter)
    }
}

/// What a delivered request learns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Something under the watched key changed; the client should rescan.
    Changed,
    /// The watch went away (handle closed, key deleted, or owner rundown).
    Cleanup,
}
