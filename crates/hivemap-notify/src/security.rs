//! Access-check collaborator used by the trigger gate.

use std::sync::Arc;

use crate::filter::ChangeFilter;
use crate::keyspace::KeyId;

/// Identity captured when a subscription is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    name: Arc<str>,
}

impl Principal {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub trait AccessChecker: Send + Sync {
    /// May `principal` learn about a `change` at `key`?
    fn check_access(&self, principal: &Principal, key: KeyId, change: ChangeFilter) -> bool;
}

/// Grants every check.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessChecker for AllowAll {
    fn check_access(&self, _principal: &Principal, _key: KeyId, _change: ChangeFilter) -> bool {
        true
    }
}
