//! Subscriber types for the reactive system.
//!
//! A Subscriber is anything that must react when a store it read from
//! changes: either a component host element (which re-renders) or a
//! [`Watch`] (which re-runs its side effect).

use std::fmt;

use crate::dom::{Node, NodeId};

use super::watch::{Watch, WatchId};

/// Unique identifier for a subscriber.
///
/// Hosts are identified by their node, watches by their watch id. This ID is
/// the key of every subscription table, which is what guarantees that a
/// subscriber appears at most once per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberId {
    Host(NodeId),
    Watch(WatchId),
}

/// A subscriber to store changes.
#[derive(Clone)]
pub enum Subscriber {
    /// A component host element that re-renders on change.
    Host(Node),
    /// A side-effect record that re-runs on change.
    Watch(Watch),
}

impl Subscriber {
    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        match self {
            Subscriber::Host(node) => SubscriberId::Host(node.id()),
            Subscriber::Watch(watch) => SubscriberId::Watch(watch.id()),
        }
    }

    pub fn as_host(&self) -> Option<&Node> {
        match self {
            Subscriber::Host(node) => Some(node),
            Subscriber::Watch(_) => None,
        }
    }

    pub fn as_watch(&self) -> Option<&Watch> {
        match self {
            Subscriber::Watch(watch) => Some(watch),
            Subscriber::Host(_) => None,
        }
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Subscriber {}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Host(node) => write!(f, "Host({node:?})"),
            Subscriber::Watch(watch) => write!(f, "{watch:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;

    #[test]
    fn host_subscribers_compare_by_node() {
        let doc = Document::new();
        let a = doc.create_element("div");
        let b = doc.create_element("div");

        assert_eq!(Subscriber::Host(a.clone()), Subscriber::Host(a.clone()));
        assert_ne!(Subscriber::Host(a.clone()).id(), Subscriber::Host(b).id());
        assert_eq!(Subscriber::Host(a.clone()).as_host(), Some(&a));
    }
}
