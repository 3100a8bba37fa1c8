//! Render Context and DOM Operations
//!
//! A render pass never touches the live DOM. Every mutation of a connected
//! node is recorded as a [`DomOp`] and the whole log is committed at once,
//! inside the platform's paint-aligned callback.
//!
//! Nodes created during the pass are detached until the operation inserting
//! them is committed, so their own subtree is built directly. The context
//! keeps a shadow child list for every live parent it touches; reads made
//! later in the same pass see the pending structure and deferred moves pick
//! the right reference sibling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::container::ContainerState;
use crate::dom::{Document, Node, NodeId};
use crate::reactive::{Subscriber, SubscriberId};
use crate::value::Value;

/// A deferred DOM mutation.
#[derive(Debug, Clone)]
pub enum DomOp {
    Create {
        node: Node,
    },
    SetAttribute {
        node: Node,
        name: String,
        /// `None` removes the attribute.
        value: Option<String>,
    },
    SetProperty {
        node: Node,
        name: String,
        value: Value,
    },
    InsertBefore {
        parent: Node,
        child: Node,
        reference: Option<Node>,
    },
    Remove {
        node: Node,
    },
    ClassListAdd {
        node: Node,
        classes: Vec<String>,
    },
}

impl DomOp {
    pub fn name(&self) -> &'static str {
        match self {
            DomOp::Create { .. } => "create",
            DomOp::SetAttribute { .. } => "set-attribute",
            DomOp::SetProperty { .. } => "set-property",
            DomOp::InsertBefore { .. } => "insert-before",
            DomOp::Remove { .. } => "remove",
            DomOp::ClassListAdd { .. } => "classlist-add",
        }
    }

    /// The node the operation mutates.
    pub fn node(&self) -> &Node {
        match self {
            DomOp::Create { node }
            | DomOp::SetAttribute { node, .. }
            | DomOp::SetProperty { node, .. }
            | DomOp::Remove { node }
            | DomOp::ClassListAdd { node, .. } => node,
            DomOp::InsertBefore { parent, .. } => parent,
        }
    }
}

/// State of one render pass.
pub(crate) struct RenderContext {
    pub(crate) state: Arc<ContainerState>,
    pub(crate) doc: Document,
    pub(crate) ops: Vec<DomOp>,
    created: HashSet<NodeId>,
    shadow: HashMap<NodeId, Vec<Node>>,
    cache: HashMap<NodeId, IndexMap<String, Value>>,
    /// Detached directly; cleaned up at commit.
    discarded: Vec<Node>,
    /// Hosts rendered in this pass.
    pub(crate) visited: IndexSet<Node>,
    /// Enclosing component hosts, innermost last.
    pub(crate) hosts: Vec<Node>,
}

impl RenderContext {
    pub(crate) fn new(state: Arc<ContainerState>) -> Self {
        let doc = state.document().clone();
        Self {
            state,
            doc,
            ops: Vec::new(),
            created: HashSet::new(),
            shadow: HashMap::new(),
            cache: HashMap::new(),
            discarded: Vec::new(),
            visited: IndexSet::new(),
            hosts: Vec::new(),
        }
    }

    /// Created in this pass and not yet attached to the live tree.
    pub(crate) fn is_new(&self, node: &Node) -> bool {
        self.created.contains(&node.id())
    }

    pub(crate) fn current_host(&self) -> Option<&Node> {
        self.hosts.last()
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    pub(crate) fn create_element(&mut self, tag: &str) -> Node {
        let node = self.doc.create_element(tag);
        self.track_created(&node);
        node
    }

    pub(crate) fn create_text(&mut self, data: &str) -> Node {
        let node = self.doc.create_text(data);
        self.track_created(&node);
        node
    }

    pub(crate) fn create_comment(&mut self, data: &str) -> Node {
        let node = self.doc.create_comment(data);
        self.track_created(&node);
        node
    }

    fn track_created(&mut self, node: &Node) {
        self.created.insert(node.id());
        self.ops.push(DomOp::Create { node: node.clone() });
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Children of `parent` as of the end of the pass so far.
    pub(crate) fn children(&self, parent: &Node) -> Vec<Node> {
        match self.shadow.get(&parent.id()) {
            Some(children) => children.clone(),
            None => parent.children(),
        }
    }

    pub(crate) fn next_sibling(&self, parent: &Node, child: &Node) -> Option<Node> {
        let children = self.children(parent);
        let index = children.iter().position(|c| c == child)?;
        children.get(index + 1).cloned()
    }

    pub(crate) fn insert_before(&mut self, parent: &Node, child: &Node, reference: Option<&Node>) {
        for list in self.shadow.values_mut() {
            list.retain(|n| n != child);
        }
        if self.is_new(parent) {
            parent.insert_before(child, reference);
            return;
        }
        let list = self
            .shadow
            .entry(parent.id())
            .or_insert_with(|| parent.children());
        list.retain(|n| n != child);
        let index = reference
            .and_then(|r| list.iter().position(|n| n == r))
            .unwrap_or(list.len());
        list.insert(index, child.clone());
        self.ops.push(DomOp::InsertBefore {
            parent: parent.clone(),
            child: child.clone(),
            reference: reference.cloned(),
        });
    }

    pub(crate) fn append_child(&mut self, parent: &Node, child: &Node) {
        self.insert_before(parent, child, None);
    }

    pub(crate) fn remove(&mut self, parent: &Node, node: &Node) {
        if self.is_new(parent) {
            parent.remove_child(node);
            self.discarded.push(node.clone());
            return;
        }
        let list = self
            .shadow
            .entry(parent.id())
            .or_insert_with(|| parent.children());
        list.retain(|n| n != node);
        self.ops.push(DomOp::Remove { node: node.clone() });
    }

    // ------------------------------------------------------------------
    // Attributes and properties
    // ------------------------------------------------------------------

    pub(crate) fn set_attribute(&mut self, node: &Node, name: &str, value: Option<String>) {
        if self.is_new(node) {
            match &value {
                Some(value) => node.set_attribute(name, value),
                None => node.remove_attribute(name),
            }
            return;
        }
        self.ops.push(DomOp::SetAttribute {
            node: node.clone(),
            name: name.to_string(),
            value,
        });
    }

    pub(crate) fn set_property(&mut self, node: &Node, name: &str, value: Value) {
        if self.is_new(node) {
            node.set_property(name, value);
            return;
        }
        self.ops.push(DomOp::SetProperty {
            node: node.clone(),
            name: name.to_string(),
            value,
        });
    }

    pub(crate) fn class_list_add(&mut self, node: &Node, classes: Vec<String>) {
        if self.is_new(node) {
            node.class_list_add(&classes);
            return;
        }
        self.ops.push(DomOp::ClassListAdd {
            node: node.clone(),
            classes,
        });
    }

    /// Last value applied for `key` on `node`.
    pub(crate) fn cached(&self, node: &Node, key: &str) -> Option<Value> {
        self.cache
            .get(&node.id())
            .and_then(|props| props.get(key).cloned())
            .or_else(|| self.state.cached_prop(node, key))
    }

    pub(crate) fn set_cached(&mut self, node: &Node, key: &str, value: Value) {
        self.cache
            .entry(node.id())
            .or_default()
            .insert(key.to_string(), value);
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Apply the operation log. Returns the committed operations.
    pub(crate) async fn commit(&mut self) -> Vec<DomOp> {
        let ops = std::mem::take(&mut self.ops);
        if ops.iter().any(|op| !matches!(op, DomOp::Create { .. })) {
            self.state.platform().raf().await;
        }
        execute_ops(&self.state, &ops).await;
        for (node, props) in self.cache.drain() {
            self.state.store_cached_props(node, props);
        }
        for node in std::mem::take(&mut self.discarded) {
            cleanup_tree(&self.state, &node).await;
        }
        self.shadow.clear();
        self.created.clear();
        ops
    }
}

/// Apply `ops` to the DOM in order.
pub(crate) async fn execute_ops(state: &Arc<ContainerState>, ops: &[DomOp]) {
    for op in ops {
        match op {
            DomOp::Create { node } => tracing::trace!(?node, "created"),
            DomOp::SetAttribute { node, name, value } => match value {
                Some(value) => node.set_attribute(name, value),
                None => node.remove_attribute(name),
            },
            DomOp::SetProperty { node, name, value } => node.set_property(name, value.clone()),
            DomOp::InsertBefore {
                parent,
                child,
                reference,
            } => parent.insert_before(child, reference.as_ref()),
            DomOp::Remove { node } => {
                cleanup_tree(state, node).await;
                node.remove();
            }
            DomOp::ClassListAdd { node, classes } => node.class_list_add(classes),
        }
    }
}

/// Tear down the runtime state of `root` and its descendants: unsubscribe
/// hosts, destroy watches, and drop element contexts and prop caches.
pub(crate) async fn cleanup_tree(state: &Arc<ContainerState>, root: &Node) {
    let mut nodes = vec![root.clone()];
    nodes.extend(root.descendants());
    for node in nodes {
        state.forget_props(&node);
        let Some(context) = state.remove_context(&node) else {
            continue;
        };
        state.subs.clear_sub(SubscriberId::Host(node.id()));
        state.unschedule(&Subscriber::Host(node.clone()));
        let watches = std::mem::take(&mut context.lock().watches);
        for watch in watches {
            state.unschedule(&Subscriber::Watch(watch.clone()));
            watch.destroy(state).await;
        }
        tracing::trace!(?node, "element context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::platform::ModulePlatform;

    fn render_context() -> (Container, RenderContext) {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let container = Container::new(&body, Arc::new(ModulePlatform::new()), Default::default());
        let rctx = RenderContext::new(container.state().clone());
        (container, rctx)
    }

    #[tokio::test]
    async fn live_mutations_are_deferred_until_commit() {
        let (container, mut rctx) = render_context();
        let body = container.element().clone();

        let div = rctx.create_element("div");
        rctx.set_attribute(&div, "id", Some("x".into()));
        rctx.append_child(&body, &div);

        assert!(!body.has_children());
        assert_eq!(div.get_attribute("id").as_deref(), Some("x"));
        assert_eq!(rctx.children(&body), vec![div.clone()]);

        let ops = rctx.commit().await;
        let names: Vec<_> = ops.iter().map(DomOp::name).collect();
        assert_eq!(names, vec!["create", "insert-before"]);
        assert_eq!(body.children(), vec![div]);
    }

    #[tokio::test]
    async fn shadow_lists_track_pending_moves() {
        let (container, mut rctx) = render_context();
        let body = container.element().clone();
        let doc = container.document().clone();
        let a = doc.create_element("a");
        let b = doc.create_element("b");
        let c = doc.create_element("c");
        for n in [&a, &b, &c] {
            body.append_child(n);
        }

        rctx.insert_before(&body, &c, Some(&a));
        assert_eq!(rctx.next_sibling(&body, &c), Some(a.clone()));
        assert_eq!(body.children(), vec![a.clone(), b.clone(), c.clone()]);

        rctx.remove(&body, &b);
        assert_eq!(rctx.children(&body), vec![c.clone(), a.clone()]);

        rctx.commit().await;
        assert_eq!(body.children(), vec![c, a]);
    }
}
