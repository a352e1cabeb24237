use std::fmt;

use crate::arena::{Key, Slab};

/// Link cell of a [`List`]. Opaque outside this crate.
pub struct Node<T> {
    value: T,
    prev: Option<NodeKey<T>>,
    next: Option<NodeKey<T>>,
}

/// Position of a value inside a [`List`].
pub type NodeKey<T> = Key<Node<T>>;

/// Doubly linked list whose nodes live in a slab.
///
/// Node keys stay valid until the node is removed; removing through a stale
/// key is a no-op. The front is the "hot" end for LRU use.
pub struct List<T> {
    nodes: Slab<Node<T>>,
    head: Option<NodeKey<T>>,
    tail: Option<NodeKey<T>>,
}

impl<T> List<T> {
    pub fn new() -> Self {
        Self {
            nodes: Slab::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeKey<T>) -> bool {
        self.nodes.contains(node)
    }

    pub fn get(&self, node: NodeKey<T>) -> Option<&T> {
        self.nodes.get(node).map(|n| &n.value)
    }

    pub fn get_mut(&mut self, node: NodeKey<T>) -> Option<&mut T> {
        self.nodes.get_mut(node).map(|n| &mut n.value)
    }

    pub fn front(&self) -> Option<NodeKey<T>> {
        self.head
    }

    pub fn back(&self) -> Option<NodeKey<T>> {
        self.tail
    }

    pub fn next(&self, node: NodeKey<T>) -> Option<NodeKey<T>> {
        self.nodes.get(node).and_then(|n| n.next)
    }

    pub fn prev(&self, node: NodeKey<T>) -> Option<NodeKey<T>> {
        self.nodes.get(node).and_then(|n| n.prev)
    }

    pub fn push_front(&mut self, value: T) -> NodeKey<T> {
        let key = self.nodes.insert(Node {
            value,
            prev: None,
            next: self.head,
        });
        self.link_front(key);
        key
    }

    pub fn push_back(&mut self, value: T) -> NodeKey<T> {
        let key = self.nodes.insert(Node {
            value,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        key
    }

    /// Inserts `value` immediately before `at`. A stale `at` appends.
    pub fn insert_before(&mut self, at: NodeKey<T>, value: T) -> NodeKey<T> {
        let Some(prev) = self.nodes.get(at).map(|n| n.prev) else {
            return self.push_back(value);
        };
        let key = self.nodes.insert(Node {
            value,
            prev,
            next: Some(at),
        });
        self.nodes[at].prev = Some(key);
        match prev {
            Some(p) => self.nodes[p].next = Some(key),
            None => self.head = Some(key),
        }
        key
    }

    /// Unlinks and returns the value at `node`; `None` if already removed.
    pub fn remove(&mut self, node: NodeKey<T>) -> Option<T> {
        if !self.nodes.contains(node) {
            return None;
        }
        self.unlink(node);
        self.nodes.remove(node).map(|n| n.value)
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.head.and_then(|h| self.remove(h))
    }

    pub fn pop_back(&mut self) -> Option<T> {
        self.tail.and_then(|t| self.remove(t))
    }

    /// Moves `node` to the front without changing its key.
    pub fn move_to_front(&mut self, node: NodeKey<T>) {
        if !self.nodes.contains(node) || self.head == Some(node) {
            return;
        }
        self.unlink(node);
        self.nodes[node].next = self.head;
        self.link_front(node);
    }

    /// Moves `node` to the back without changing its key.
    pub fn move_to_back(&mut self, node: NodeKey<T>) {
        if !self.nodes.contains(node) || self.tail == Some(node) {
            return;
        }
        self.unlink(node);
        let n = &mut self.nodes[node];
        n.prev = self.tail;
        n.next = None;
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(node),
            None => self.head = Some(node),
        }
        self.tail = Some(node);
    }

    /// Iterates front to back.
    pub fn iter(&self) -> ListIter<'_, T> {
        ListIter {
            list: self,
            cursor: self.head,
            forward: true,
        }
    }

    /// Iterates back to front.
    pub fn iter_rev(&self) -> ListIter<'_, T> {
        ListIter {
            list: self,
            cursor: self.tail,
            forward: false,
        }
    }

    pub fn clear(&mut self) {
        self.nodes = Slab::new();
        self.head = None;
        self.tail = None;
    }

    fn link_front(&mut self, key: NodeKey<T>) {
        self.nodes[key].prev = None;
        match self.head {
            Some(head) => self.nodes[head].prev = Some(key),
            None => self.tail = Some(key),
        }
        self.head = Some(key);
    }

    fn unlink(&mut self, node: NodeKey<T>) {
        let (prev, next) = {
            let n = &self.nodes[node];
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        let n = &mut self.nodes[node];
        n.prev = None;
        n.next = None;
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter().map(|(_, v)| v)).finish()
    }
}

pub struct ListIter<'a, T> {
    list: &'a List<T>,
    cursor: Option<NodeKey<T>>,
    forward: bool,
}

impl<'a, T> Iterator for ListIter<'a, T> {
    type Item = (NodeKey<T>, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor?;
        let node = self.list.nodes.get(key)?;
        self.cursor = if self.forward { node.next } else { node.prev };
        Some((key, &node.value))
    }
}
