//! Two-phase release of key-object references.
//!
//! Dropping the last reference on a key object re-enters the hub, so the
//! dispatcher never does it while holding the notify lock. Critical sections
//! collect references into a [`DeferredReleases`] batch that the caller drains
//! once the lock is gone.

use std::sync::Arc;

use crate::hub::KeyObject;

/// References waiting to be released outside the notify lock.
#[derive(Default)]
#[must_use = "deferred releases must be drained after the notify lock is dropped"]
pub struct DeferredReleases {
    objects: Vec<Arc<KeyObject>>,
}

impl DeferredReleases {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn defer(&mut self, object: Arc<KeyObject>) {
        self.objects.push(object);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Releases every queued reference exactly once.
    pub fn drain(mut self) {
        for object in std::mem::take(&mut self.objects) {
            drop(object);
        }
    }
}

impl Drop for DeferredReleases {
    fn drop(&mut self) {
        // Dropped without drain (unwinding, or an early return): release
        // anyway. Doing so under the notify lock trips the reentrancy assert.
        self.objects.clear();
    }
}

impl std::fmt::Debug for DeferredReleases {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredReleases")
            .field("pending", &self.objects.len())
            .finish()
    }
}
