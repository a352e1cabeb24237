//! Keyspace collaborator.
//!
//! The hub only needs to walk from a key towards the root and to know which
//! file (hive) a key lives in. Key identity is [`KeyId`] equality; names are
//! never compared.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub u64);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

/// One backing file's share of the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HiveId(pub u32);

impl HiveId {
    /// The shared root file every change is also reported to.
    pub const ROOT: HiveId = HiveId(0);
}

impl fmt::Display for HiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hive#{}", self.0)
    }
}

pub trait Keyspace: Send + Sync {
    /// Levels below the root; the root key has depth 0.
    fn depth(&self, key: KeyId) -> Option<u32>;

    fn parent(&self, key: KeyId) -> Option<KeyId>;

    /// Walks `levels` parents up from `key`.
    fn ancestor(&self, key: KeyId, levels: u32) -> Option<KeyId> {
        let mut current = key;
        for _ in 0..levels {
            current = self.parent(current)?;
        }
        Some(current)
    }

    fn hive_of(&self, key: KeyId) -> Option<HiveId>;

    fn root_hive(&self) -> HiveId {
        HiveId::ROOT
    }

    fn is_deleted(&self, key: KeyId) -> bool;
}

struct KeyNode {
    name: String,
    parent: Option<KeyId>,
    depth: u32,
    hive: HiveId,
    deleted: bool,
}

#[derive(Default)]
struct TreeInner {
    nodes: Vec<KeyNode>,
    by_path: HashMap<String, KeyId>,
}

/// In-memory keyspace addressed by `/`-separated paths.
pub struct KeyTree {
    inner: RwLock<TreeInner>,
}

impl Default for KeyTree {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

impl KeyTree {
    /// A tree holding only the root key `/` in [`HiveId::ROOT`].
    pub fn new() -> Self {
        let mut inner = TreeInner::default();
        inner.nodes.push(KeyNode {
            name: String::new(),
            parent: None,
            depth: 0,
            hive: HiveId::ROOT,
            deleted: false,
        });
        inner.by_path.insert("/".to_string(), KeyId(0));
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub fn root(&self) -> KeyId {
        KeyId(0)
    }

    /// Creates `path` and any missing ancestors. New keys live in their
    /// parent's hive.
    pub fn create(&self, path: &str) -> KeyId {
        self.create_in(path, None)
    }

    /// Creates `path` as the entry key of `hive`; keys created below it
    /// inherit that hive.
    pub fn mount(&self, path: &str, hive: HiveId) -> KeyId {
        self.create_in(path, Some(hive))
    }

    fn create_in(&self, path: &str, hive: Option<HiveId>) -> KeyId {
        let path = normalize(path);
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let mut current = KeyId(0);
        let mut walked = String::new();
        let segments: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for (i, segment) in segments.iter().enumerate() {
            walked.push('/');
            walked.push_str(segment);
            let last = i + 1 == segments.len();
            let existing = inner
                .by_path
                .get(&walked)
                .copied()
                .filter(|id| !inner.nodes[id.0 as usize].deleted);
            current = match existing {
                Some(id) => id,
                None => {
                    let parent = &inner.nodes[current.0 as usize];
                    let node = KeyNode {
                        name: (*segment).to_string(),
                        parent: Some(current),
                        depth: parent.depth + 1,
                        hive: if last { hive.unwrap_or(parent.hive) } else { parent.hive },
                        deleted: false,
                    };
                    let id = KeyId(inner.nodes.len() as u64);
                    inner.nodes.push(node);
                    inner.by_path.insert(walked.clone(), id);
                    id
                }
            };
        }
        current
    }

    pub fn key(&self, path: &str) -> Option<KeyId> {
        let inner = self.inner.read();
        let id = *inner.by_path.get(&normalize(path))?;
        (!inner.nodes[id.0 as usize].deleted).then_some(id)
    }

    pub fn path(&self, key: KeyId) -> Option<String> {
        let inner = self.inner.read();
        let mut parts = Vec::new();
        let mut current = inner.nodes.get(key.0 as usize)?;
        while let Some(parent) = current.parent {
            parts.push(current.name.as_str());
            current = &inner.nodes[parent.0 as usize];
        }
        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }

    /// Marks `key` deleted. The id stays valid for ancestor walks, but
    /// lookups by path no longer find it.
    pub fn delete(&self, key: KeyId) -> bool {
        let mut inner = self.inner.write();
        match inner.nodes.get_mut(key.0 as usize) {
            Some(node) if node.parent.is_some() && !node.deleted => {
                node.deleted = true;
                true
            }
            _ => false,
        }
    }
}

impl Keyspace for KeyTree {
    fn depth(&self, key: KeyId) -> Option<u32> {
        self.inner.read().nodes.get(key.0 as usize).map(|n| n.depth)
    }

    fn parent(&self, key: KeyId) -> Option<KeyId> {
        self.inner.read().nodes.get(key.0 as usize)?.parent
    }

    fn ancestor(&self, key: KeyId, levels: u32) -> Option<KeyId> {
        let inner = self.inner.read();
        let mut current = key;
        for _ in 0..levels {
            current = inner.nodes.get(current.0 as usize)?.parent?;
        }
        Some(current)
    }

    fn hive_of(&self, key: KeyId) -> Option<HiveId> {
        self.inner.read().nodes.get(key.0 as usize).map(|n| n.hive)
    }

    fn is_deleted(&self, key: KeyId) -> bool {
        self.inner
            .read()
            .nodes
            .get(key.0 as usize)
            .map_or(true, |n| n.deleted)
    }
}
