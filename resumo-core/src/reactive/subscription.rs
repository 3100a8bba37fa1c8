//! Subscription Manager
//!
//! The subscription manager correlates store targets with the subscribers
//! that read them. It is the per-container replacement for a global signal
//! registry.
//!
//! # Tables
//!
//! - Forward: `target → (subscriber → key-set | unscoped)`. An unscoped entry
//!   is notified on any change to the target; a scoped entry only when one of
//!   its keys is written.
//! - Reverse: `subscriber → targets`, so that every subscription held by a
//!   subscriber can be dropped in one pass when it re-runs or is destroyed.
//!
//! Re-subscribing merges into the existing entry and never duplicates it.

use std::sync::Arc;

use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::value::TargetId;

use super::subscriber::{Subscriber, SubscriberId};

/// Keys a scoped subscriber listens to.
pub type KeySet = SmallVec<[Arc<str>; 4]>;

/// One subscriber's interest in a target. `keys == None` means unscoped.
#[derive(Debug, Clone)]
pub struct SubEntry {
    pub subscriber: Subscriber,
    pub keys: Option<KeySet>,
}

impl SubEntry {
    fn matches(&self, key: Option<&str>) -> bool {
        match (&self.keys, key) {
            (None, _) | (_, None) => true,
            (Some(keys), Some(key)) => keys.iter().any(|k| &**k == key),
        }
    }
}

/// Subscribers of a single target.
pub struct LocalSubscriptionManager {
    target: TargetId,
    subs: Mutex<IndexMap<SubscriberId, SubEntry>>,
}

impl LocalSubscriptionManager {
    fn new(target: TargetId, initial: Vec<SubEntry>) -> Self {
        let subs = initial
            .into_iter()
            .map(|entry| (entry.subscriber.id(), entry))
            .collect();
        Self {
            target,
            subs: Mutex::new(subs),
        }
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    /// Record interest. An unscoped entry absorbs any later scoped request.
    fn add(&self, subscriber: Subscriber, key: Option<&str>) {
        let mut subs = self.subs.lock();
        let entry = subs.entry(subscriber.id()).or_insert_with(|| SubEntry {
            subscriber,
            keys: key.map(|_| KeySet::new()),
        });
        match (key, &mut entry.keys) {
            (None, keys) => *keys = None,
            (Some(key), Some(keys)) => {
                if !keys.iter().any(|k| &**k == key) {
                    keys.push(Arc::from(key));
                }
            }
            (Some(_), None) => {}
        }
    }

    fn remove(&self, id: SubscriberId) {
        self.subs.lock().shift_remove(&id);
    }

    /// Subscribers to notify for a change of `key` (`None` = whole target).
    pub fn subscribers_for(&self, key: Option<&str>) -> Vec<Subscriber> {
        self.subs
            .lock()
            .values()
            .filter(|entry| entry.matches(key))
            .map(|entry| entry.subscriber.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SubEntry> {
        self.subs.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.lock().is_empty()
    }
}

/// Container-wide subscription tables.
#[derive(Default)]
pub struct SubscriptionManager {
    tables: DashMap<TargetId, Arc<LocalSubscriptionManager>>,
    by_subscriber: DashMap<SubscriberId, IndexSet<TargetId>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the table for `target`, creating it (seeded with `initial`)
    /// when it does not exist yet.
    pub fn get_local(
        &self,
        target: TargetId,
        initial: Option<Vec<SubEntry>>,
    ) -> Arc<LocalSubscriptionManager> {
        if let Some(local) = self.tables.get(&target) {
            return local.clone();
        }
        let initial = initial.unwrap_or_default();
        for entry in &initial {
            self.by_subscriber
                .entry(entry.subscriber.id())
                .or_default()
                .insert(target);
        }
        self.tables
            .entry(target)
            .or_insert_with(|| Arc::new(LocalSubscriptionManager::new(target, initial)))
            .clone()
    }

    pub fn try_get_local(&self, target: TargetId) -> Option<Arc<LocalSubscriptionManager>> {
        self.tables.get(&target).map(|local| local.clone())
    }

    /// Subscribe `subscriber` to `target`, scoped to `key` when given.
    pub fn add_sub(&self, target: TargetId, subscriber: Subscriber, key: Option<&str>) {
        let id = subscriber.id();
        self.get_local(target, None).add(subscriber, key);
        self.by_subscriber.entry(id).or_default().insert(target);
        tracing::trace!(?id, ?target, key, "subscribed");
    }

    /// Subscribers interested in a change of `key` on `target`.
    pub fn notify_subs(&self, target: TargetId, key: Option<&str>) -> Vec<Subscriber> {
        self.try_get_local(target)
            .map(|local| local.subscribers_for(key))
            .unwrap_or_default()
    }

    /// Remove every subscription held by `id`.
    pub fn clear_sub(&self, id: SubscriberId) {
        let Some((_, targets)) = self.by_subscriber.remove(&id) else {
            return;
        };
        for target in targets {
            if let Some(local) = self.try_get_local(target) {
                local.remove(id);
            }
        }
    }

    /// Targets `id` is currently subscribed to.
    pub fn targets_of(&self, id: SubscriberId) -> Vec<TargetId> {
        self.by_subscriber
            .get(&id)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;
    use crate::value::Target;

    fn host(doc: &Document) -> Subscriber {
        Subscriber::Host(doc.create_element("div"))
    }

    #[test]
    fn scoped_subscribers_only_see_their_keys() {
        let doc = Document::new();
        let manager = SubscriptionManager::new();
        let target = Target::object().id();
        let a = host(&doc);
        let b = host(&doc);

        manager.add_sub(target, a.clone(), Some("count"));
        manager.add_sub(target, b.clone(), Some("name"));

        assert_eq!(manager.notify_subs(target, Some("count")), vec![a.clone()]);
        assert_eq!(manager.notify_subs(target, Some("name")), vec![b.clone()]);
        assert_eq!(manager.notify_subs(target, None).len(), 2);
    }

    #[test]
    fn unscoped_subscribers_see_everything() {
        let doc = Document::new();
        let manager = SubscriptionManager::new();
        let target = Target::object().id();
        let a = host(&doc);

        manager.add_sub(target, a.clone(), None);
        assert_eq!(manager.notify_subs(target, Some("anything")), vec![a.clone()]);

        // A later scoped read does not narrow the entry.
        manager.add_sub(target, a.clone(), Some("x"));
        assert_eq!(manager.notify_subs(target, Some("y")), vec![a]);
    }

    #[test]
    fn resubscribing_never_duplicates() {
        let doc = Document::new();
        let manager = SubscriptionManager::new();
        let target = Target::object().id();
        let a = host(&doc);

        for _ in 0..3 {
            manager.add_sub(target, a.clone(), Some("count"));
        }
        manager.add_sub(target, a.clone(), Some("other"));

        let local = manager.get_local(target, None);
        assert_eq!(local.len(), 1);
        let keys = local.snapshot()[0].keys.clone().unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn clear_sub_removes_from_every_table() {
        let doc = Document::new();
        let manager = SubscriptionManager::new();
        let t1 = Target::object().id();
        let t2 = Target::object().id();
        let a = host(&doc);
        let b = host(&doc);

        manager.add_sub(t1, a.clone(), Some("x"));
        manager.add_sub(t2, a.clone(), None);
        manager.add_sub(t2, b.clone(), None);
        assert_eq!(manager.targets_of(a.id()).len(), 2);

        manager.clear_sub(a.id());

        assert!(manager.notify_subs(t1, Some("x")).is_empty());
        assert_eq!(manager.notify_subs(t2, None), vec![b]);
        assert!(manager.targets_of(a.id()).is_empty());
    }

    #[test]
    fn get_local_seeds_initial_subscribers_once() {
        let doc = Document::new();
        let manager = SubscriptionManager::new();
        let target = Target::object().id();
        let a = host(&doc);

        let seeded = vec![SubEntry {
            subscriber: a.clone(),
            keys: Some(KeySet::from_iter([Arc::from("count")])),
        }];
        manager.get_local(target, Some(seeded.clone()));
        // A second seed is ignored; the table already exists.
        manager.get_local(target, Some(seeded));

        assert_eq!(manager.get_local(target, None).len(), 1);
        assert_eq!(manager.targets_of(a.id()), vec![target]);
    }
}
