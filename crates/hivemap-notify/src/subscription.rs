//! Per-file, depth-sorted subscription lists.
//!
//! Each hive keeps one list ordered by the depth of the watched key. A change
//! at depth `d` only has to look at the prefix of the list with depth `<= d`,
//! and a candidate matches when walking `d - depth` parents up from the
//! changed key lands on the watched key.

use std::collections::HashMap;

use hivemap_slab::{Key, List, NodeKey, Slab};

use crate::filter::ChangeFilter;
use crate::hub::ObjectId;
use crate::keyspace::{HiveId, KeyId, Keyspace};
use crate::request::ReqId;
use crate::security::Principal;

pub(crate) type SubId = Key<Subscription>;

pub(crate) struct Subscription {
    pub object: ObjectId,
    pub key: KeyId,
    pub hive: HiveId,
    pub depth: u32,
    pub watch_subtree: bool,
    pub filter: ChangeFilter,
    pub principal: Principal,
    /// A change arrived while no request was queued.
    pub pending: bool,
    /// Oldest first.
    pub queue: List<ReqId>,
    node: Option<NodeKey<SubId>>,
}

/// Parameters of a new subscription.
pub(crate) struct NewSubscription {
    pub object: ObjectId,
    pub key: KeyId,
    pub hive: HiveId,
    pub depth: u32,
    pub watch_subtree: bool,
    pub filter: ChangeFilter,
    pub principal: Principal,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subs: Slab<Subscription>,
    hives: HashMap<HiveId, List<SubId>>,
    by_object: HashMap<ObjectId, SubId>,
}

impl SubscriptionRegistry {
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn get(&self, id: SubId) -> Option<&Subscription> {
        self.subs.get(id)
    }

    pub fn get_mut(&mut self, id: SubId) -> Option<&mut Subscription> {
        self.subs.get_mut(id)
    }

    pub fn for_object(&self, object: ObjectId) -> Option<SubId> {
        self.by_object.get(&object).copied()
    }

    /// Returns the subscription of `new.object`, creating it if needed. An
    /// existing subscription keeps its original filter and scope.
    pub fn add(&mut self, new: NewSubscription) -> SubId {
        if let Some(id) = self.for_object(new.object) {
            return id;
        }

        let list = self.hives.entry(new.hive).or_default();
        let id = self.subs.insert(Subscription {
            object: new.object,
            key: new.key,
            hive: new.hive,
            depth: new.depth,
            watch_subtree: new.watch_subtree,
            filter: new.filter,
            principal: new.principal,
            pending: false,
            queue: List::new(),
            node: None,
        });

        let before = list
            .iter()
            .find(|(_, other)| self.subs[**other].depth > new.depth)
            .map(|(node, _)| node);
        let node = match before {
            Some(at) => list.insert_before(at, id),
            None => list.push_back(id),
        };
        self.subs[id].node = Some(node);
        self.by_object.insert(new.object, id);
        id
    }

    /// Unlinks and returns a subscription. Its queue must already be empty.
    pub fn remove(&mut self, id: SubId) -> Option<Subscription> {
        let sub = self.subs.remove(id)?;
        debug_assert!(sub.queue.is_empty(), "subscription removed with queued requests");
        if let (Some(list), Some(node)) = (self.hives.get_mut(&sub.hive), sub.node) {
            list.remove(node);
            if list.is_empty() {
                self.hives.remove(&sub.hive);
            }
        }
        self.by_object.remove(&sub.object);
        Some(sub)
    }

    /// Subscriptions in `hive` interested in `change` at `changed`, in list
    /// (depth-ascending) order.
    pub fn matching(
        &self,
        keyspace: &dyn Keyspace,
        hive: HiveId,
        changed: KeyId,
        change: ChangeFilter,
    ) -> Vec<SubId> {
        let Some(list) = self.hives.get(&hive) else {
            return Vec::new();
        };
        let Some(depth) = keyspace.depth(changed) else {
            return Vec::new();
        };

        let mut ancestors: HashMap<u32, Option<KeyId>> = HashMap::new();
        let mut matched = Vec::new();
        for (_, id) in list.iter() {
            let sub = &self.subs[*id];
            if sub.depth > depth {
                break;
            }
            let levels = depth - sub.depth;
            let ancestor = *ancestors
                .entry(levels)
                .or_insert_with(|| keyspace.ancestor(changed, levels));
            if ancestor != Some(sub.key) {
                continue;
            }
            if (sub.watch_subtree || levels == 0) && sub.filter.intersects(change) {
                matched.push(*id);
            }
        }
        matched
    }

    /// Subscriptions watching exactly `key`, in any hive.
    pub fn watching(&self, key: KeyId) -> Vec<SubId> {
        self.subs
            .iter()
            .filter(|(_, sub)| sub.key == key)
            .map(|(id, _)| id)
            .collect()
    }

    /// Depths of `hive`'s list in stored order.
    pub fn depths(&self, hive: HiveId) -> Vec<u32> {
        self.hives
            .get(&hive)
            .map(|list| list.iter().map(|(_, id)| self.subs[*id].depth).collect())
            .unwrap_or_default()
    }
}
