//! Document Model
//!
//! The engine talks to the DOM through a deliberately narrow surface:
//! create element/text/comment, read and write attributes and properties,
//! insert and remove children, walk the tree, and serialize it to HTML.
//! This module provides an in-memory implementation of that surface so the
//! runtime works identically with or without a browser.
//!
//! Nodes are reference counted handles. Parents own their children; a child
//! holds a weak back-pointer to its parent, so a detached subtree is freed as
//! soon as the last handle to it goes away.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::value::Value;

/// Unique identifier for a DOM node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// What a node is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element(Arc<str>),
    Text,
    Comment,
}

/// Native event listener attached through [`Node::add_event_listener`].
pub type EventListener = Arc<dyn Fn(&Node, &str) + Send + Sync>;

struct NodeInner {
    id: NodeId,
    kind: NodeKind,
    owner: Weak<NodeInner>,
    data: RwLock<NodeData>,
}

#[derive(Default)]
struct NodeData {
    parent: Weak<NodeInner>,
    children: Vec<Node>,
    attributes: IndexMap<String, String>,
    properties: IndexMap<String, Value>,
    text: String,
    listeners: Vec<(String, EventListener)>,
}

/// Handle to a node in a document.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

/// Handle to a document. Wraps the document node.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Document(Node);

/// Keys that live on the element as properties rather than attributes.
const PROPERTY_KEYS: &[&str] = &["value", "checked", "selected", "innerHTML"];

impl Document {
    /// Create a document holding `<html><head></head><body></body></html>`.
    pub fn new() -> Self {
        let root = Arc::new_cyclic(|weak| NodeInner {
            id: NodeId::next(),
            kind: NodeKind::Document,
            owner: weak.clone(),
            data: RwLock::new(NodeData::default()),
        });
        let doc = Document(Node(root));
        let html = doc.create_element("html");
        html.append_child(&doc.create_element("head"));
        html.append_child(&doc.create_element("body"));
        doc.0.append_child(&html);
        doc
    }

    fn create(&self, kind: NodeKind) -> Node {
        Node(Arc::new(NodeInner {
            id: NodeId::next(),
            kind,
            owner: Arc::downgrade(&self.0 .0),
            data: RwLock::new(NodeData::default()),
        }))
    }

    /// The document node itself.
    pub fn node(&self) -> &Node {
        &self.0
    }

    pub fn create_element(&self, tag: &str) -> Node {
        self.create(NodeKind::Element(Arc::from(tag.to_ascii_lowercase())))
    }

    pub fn create_text(&self, text: &str) -> Node {
        let node = self.create(NodeKind::Text);
        node.set_data(text);
        node
    }

    pub fn create_comment(&self, text: &str) -> Node {
        let node = self.create(NodeKind::Comment);
        node.set_data(text);
        node
    }

    /// The `<html>` element.
    pub fn document_element(&self) -> Option<Node> {
        self.0.children().into_iter().find(Node::is_element)
    }

    pub fn head(&self) -> Option<Node> {
        self.0.query_first(|n| n.is_tag("head"))
    }

    pub fn body(&self) -> Option<Node> {
        self.0.query_first(|n| n.is_tag("body"))
    }

    /// Copy a node (from any document) into this one. Attributes, text and,
    /// when `deep`, children are copied; properties and listeners are not.
    pub fn import_node(&self, node: &Node, deep: bool) -> Node {
        let copy = self.create(node.kind().clone());
        {
            let src = node.0.data.read();
            let mut dst = copy.0.data.write();
            dst.attributes = src.attributes.clone();
            dst.text = src.text.clone();
        }
        if deep {
            for child in node.children() {
                if child.kind() == &NodeKind::Document {
                    continue;
                }
                copy.append_child(&self.import_node(&child, true));
            }
        }
        copy
    }

    /// Copy a whole document. Used to simulate loading serialized HTML in a
    /// fresh page.
    pub fn clone_document(&self) -> Document {
        let fresh = Document::new();
        if let Some(html) = fresh.document_element() {
            html.remove();
        }
        if let Some(html) = self.document_element() {
            fresh.0.append_child(&fresh.import_node(&html, true));
        }
        fresh
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Document({})", self.0.id().raw())
    }
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.0.kind
    }

    pub fn is_element(&self) -> bool {
        matches!(self.0.kind, NodeKind::Element(_))
    }

    pub fn is_text(&self) -> bool {
        self.0.kind == NodeKind::Text
    }

    pub fn is_comment(&self) -> bool {
        self.0.kind == NodeKind::Comment
    }

    pub fn is_document(&self) -> bool {
        self.0.kind == NodeKind::Document
    }

    /// Lower-case tag name, for elements.
    pub fn tag(&self) -> Option<&str> {
        match &self.0.kind {
            NodeKind::Element(tag) => Some(tag),
            _ => None,
        }
    }

    pub fn is_tag(&self, tag: &str) -> bool {
        self.tag() == Some(tag)
    }

    pub fn owner_document(&self) -> Option<Document> {
        self.0.owner.upgrade().map(|inner| Document(Node(inner)))
    }

    // ------------------------------------------------------------------
    // Attributes and properties
    // ------------------------------------------------------------------

    pub fn get_attribute(&self, name: &str) -> Option<String> {
        self.0.data.read().attributes.get(name).cloned()
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.0.data.read().attributes.contains_key(name)
    }

    pub fn set_attribute(&self, name: &str, value: &str) {
        self.0
            .data
            .write()
            .attributes
            .insert(name.to_string(), value.to_string());
    }

    pub fn remove_attribute(&self, name: &str) {
        self.0.data.write().attributes.shift_remove(name);
    }

    pub fn attributes(&self) -> Vec<(String, String)> {
        self.0
            .data
            .read()
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Whether `key` is a property of elements (as opposed to an attribute).
    pub fn has_property_key(&self, key: &str) -> bool {
        self.is_element() && PROPERTY_KEYS.contains(&key)
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        if name == "data" && !self.is_element() {
            return Some(Value::from(self.data()));
        }
        self.0.data.read().properties.get(name).cloned()
    }

    pub fn set_property(&self, name: &str, value: Value) {
        if name == "data" && !self.is_element() {
            self.set_data(&value.to_display_string());
            return;
        }
        self.0
            .data
            .write()
            .properties
            .insert(name.to_string(), value);
    }

    /// Character data of a text or comment node.
    pub fn data(&self) -> String {
        self.0.data.read().text.clone()
    }

    pub fn set_data(&self, text: &str) {
        self.0.data.write().text = text.to_string();
    }

    pub fn classes(&self) -> Vec<String> {
        self.get_attribute("class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn class_list_add(&self, classes: &[String]) {
        let mut current = self.classes();
        for class in classes {
            if !current.contains(class) {
                current.push(class.clone());
            }
        }
        self.set_attribute("class", &current.join(" "));
    }

    // ------------------------------------------------------------------
    // Tree structure
    // ------------------------------------------------------------------

    pub fn parent(&self) -> Option<Node> {
        self.0.data.read().parent.upgrade().map(Node)
    }

    pub fn children(&self) -> Vec<Node> {
        self.0.data.read().children.clone()
    }

    pub fn first_child(&self) -> Option<Node> {
        self.0.data.read().children.first().cloned()
    }

    pub fn has_children(&self) -> bool {
        !self.0.data.read().children.is_empty()
    }

    pub fn next_sibling(&self) -> Option<Node> {
        let parent = self.parent()?;
        let data = parent.0.data.read();
        let index = data.children.iter().position(|c| c == self)?;
        data.children.get(index + 1).cloned()
    }

    pub fn append_child(&self, child: &Node) {
        self.insert_before(child, None);
    }

    /// Insert `child` before `reference`, or at the end when `reference` is
    /// `None` or not a child of this node. A child that already has a parent
    /// is moved.
    pub fn insert_before(&self, child: &Node, reference: Option<&Node>) {
        if child == self {
            return;
        }
        child.remove();
        let mut data = self.0.data.write();
        let index = reference
            .and_then(|r| data.children.iter().position(|c| c == r))
            .unwrap_or(data.children.len());
        data.children.insert(index, child.clone());
        drop(data);
        child.0.data.write().parent = Arc::downgrade(&self.0);
    }

    pub fn remove_child(&self, child: &Node) {
        let mut data = self.0.data.write();
        if let Some(index) = data.children.iter().position(|c| c == child) {
            data.children.remove(index);
            drop(data);
            child.0.data.write().parent = Weak::new();
        }
    }

    /// Detach this node from its parent.
    pub fn remove(&self) {
        if let Some(parent) = self.parent() {
            parent.remove_child(self);
        }
    }

    /// Whether the node is attached to its document.
    pub fn is_connected(&self) -> bool {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if node.is_document() {
                return true;
            }
            current = node.parent();
        }
        false
    }

    /// All descendants in document order, excluding this node.
    pub fn descendants(&self) -> Vec<Node> {
        let mut out = Vec::new();
        let mut stack: Vec<Node> = self.children().into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            stack.extend(node.children().into_iter().rev());
            out.push(node);
        }
        out
    }

    pub fn query_first(&self, pred: impl Fn(&Node) -> bool) -> Option<Node> {
        self.descendants().into_iter().find(|n| pred(n))
    }

    /// Nearest inclusive ancestor matching `pred`.
    pub fn closest(&self, pred: impl Fn(&Node) -> bool) -> Option<Node> {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if pred(&node) {
                return Some(node);
            }
            current = node.parent();
        }
        None
    }

    fn path(&self) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            let index = parent
                .0
                .data
                .read()
                .children
                .iter()
                .position(|c| c == &current)
                .unwrap_or(0);
            path.push(index);
            current = parent;
        }
        path.reverse();
        path
    }

    /// Order two nodes by their position in the document (pre-order).
    pub fn document_order(&self, other: &Node) -> Ordering {
        self.path().cmp(&other.path())
    }

    pub fn text_content(&self) -> String {
        match self.kind() {
            NodeKind::Text => self.data(),
            NodeKind::Comment => String::new(),
            _ => self.children().iter().map(Node::text_content).collect(),
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn add_event_listener(&self, event: &str, listener: EventListener) {
        self.0
            .data
            .write()
            .listeners
            .push((event.to_string(), listener));
    }

    /// Invoke native listeners registered for `event` on this node.
    pub fn dispatch_event(&self, event: &str) {
        let listeners: Vec<EventListener> = self
            .0
            .data
            .read()
            .listeners
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(self, event);
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            NodeKind::Element(tag) => match self.get_attribute("q:id") {
                Some(qid) => write!(f, "<{tag} q:id={qid}>"),
                None => write!(f, "<{tag}#{}>", self.id().raw()),
            },
            NodeKind::Text => write!(f, "#text({:?})", self.data()),
            NodeKind::Comment => write!(f, "#comment({:?})", self.data()),
            NodeKind::Document => write!(f, "#document"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_document_has_head_and_body() {
        let doc = Document::new();
        assert!(doc.head().is_some());
        let body = doc.body().unwrap();
        assert!(body.is_connected());
        let html = doc.document_element().unwrap();
        assert!(html.is_tag("html"));
        assert_eq!(html.children(), vec![doc.head().unwrap(), body]);
    }

    #[test]
    fn insert_before_moves_existing_children() {
        let doc = Document::new();
        let list = doc.create_element("ul");
        let a = doc.create_element("li");
        let b = doc.create_element("li");
        let c = doc.create_element("li");
        for item in [&a, &b, &c] {
            list.append_child(item);
        }

        list.insert_before(&c, Some(&a));
        assert_eq!(list.children(), vec![c.clone(), a.clone(), b.clone()]);
        assert_eq!(c.next_sibling(), Some(a.clone()));
        assert_eq!(b.next_sibling(), None);
    }

    #[test]
    fn document_order_follows_preorder() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let outer = doc.create_element("div");
        let inner = doc.create_element("span");
        let after = doc.create_element("p");
        body.append_child(&outer);
        outer.append_child(&inner);
        body.append_child(&after);

        assert_eq!(outer.document_order(&inner), Ordering::Less);
        assert_eq!(inner.document_order(&after), Ordering::Less);
        assert_eq!(after.document_order(&outer), Ordering::Greater);
    }

    #[test]
    fn detached_nodes_are_not_connected() {
        let doc = Document::new();
        let div = doc.create_element("div");
        assert!(!div.is_connected());
        doc.body().unwrap().append_child(&div);
        assert!(div.is_connected());
        div.remove();
        assert!(!div.is_connected());
    }

    #[test]
    fn clone_document_copies_attributes_and_text() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let span = doc.create_element("span");
        span.set_attribute("q:id", "0");
        span.append_child(&doc.create_text("a < b"));
        body.append_child(&span);

        let copy = doc.clone_document();
        let copied = copy.body().unwrap().first_child().unwrap();
        assert_ne!(copied, span);
        assert!(copied.is_tag("span"));
        assert_eq!(copied.get_attribute("q:id").as_deref(), Some("0"));
        assert_eq!(copied.text_content(), "a < b");
        assert_eq!(copied.owner_document(), Some(copy));
    }
}
