//! # hivemap-slab
//!
//! Owned storage for the cache and notification bookkeeping.
//!
//! Everything that would otherwise be threaded together with intrusive
//! pointers (LRU chains, depth-sorted subscription lists, per-owner request
//! lists) lives here as values in a [`Slab`] addressed by generation-checked
//! [`Key`]s, or as nodes of a slab-backed [`List`].
//!
//! A key outlives the value it names without harm: once the slot is reused,
//! the generation no longer matches and every lookup returns `None`.

mod arena;
mod list;

pub use arena::{Key, Slab};
pub use list::{List, ListIter, Node, NodeKey};
