//! Declarative Trees
//!
//! [`JsxNode`] is the immutable description a render function returns. The
//! reconciler compares it against the live DOM.
//!
//! Nodes are built with small constructors and chained builder methods:
//!
//! ```ignore
//! h("ul").children(items.iter().map(|item| h("li").key(item.id).child(item.label)))
//! ```

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::qrl::Qrl;
use crate::value::Value;

/// Prop holding a component's render QRL.
pub const RENDER_PROP: &str = "q:render";
/// Prop naming the slot a child is projected into.
pub const SLOT_PROP: &str = "q:slot";
/// Tag of slot holes inside component output.
pub const SLOT_TAG: &str = "q:slot";
/// Tag of the element parking projected children with no matching slot.
pub const TEMPLATE_TAG: &str = "q:template";

/// Kind of a declarative node.
#[derive(Debug, Clone, PartialEq)]
pub enum JsxKind {
    Element(Arc<str>),
    Text(Arc<str>),
    Comment(Arc<str>),
    /// Binds props onto the enclosing component host.
    Host,
    /// Keeps the existing children of the parent untouched.
    Skip,
    /// Nothing; dropped when added as a child.
    Empty,
}

#[derive(Clone)]
struct JsxInner {
    kind: JsxKind,
    key: Option<Arc<str>>,
    props: IndexMap<String, Value>,
    children: Vec<JsxNode>,
}

/// A node of a declarative tree.
#[derive(Clone)]
pub struct JsxNode(Arc<JsxInner>);

impl JsxNode {
    fn of(kind: JsxKind) -> Self {
        Self(Arc::new(JsxInner {
            kind,
            key: None,
            props: IndexMap::new(),
            children: Vec::new(),
        }))
    }

    /// A component rendered by `render` into a `tag` host element.
    pub fn component(tag: &str, render: Qrl) -> Self {
        h(tag).prop(RENDER_PROP, render)
    }

    pub fn kind(&self) -> &JsxKind {
        &self.0.kind
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.0.kind {
            JsxKind::Element(tag) => Some(tag),
            _ => None,
        }
    }

    pub fn key_str(&self) -> Option<&str> {
        self.0.key.as_deref()
    }

    pub fn props(&self) -> &IndexMap<String, Value> {
        &self.0.props
    }

    pub fn child_nodes(&self) -> &[JsxNode] {
        &self.0.children
    }

    /// The render QRL when this node is a component.
    pub fn render_qrl(&self) -> Option<&Qrl> {
        self.0.props.get(RENDER_PROP).and_then(Value::as_qrl)
    }

    pub fn is_component(&self) -> bool {
        self.render_qrl().is_some()
    }

    /// Slot this node is projected into (`""` for the default slot).
    pub fn slot_name(&self) -> &str {
        self.0
            .props
            .get(SLOT_PROP)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn ptr_eq(&self, other: &JsxNode) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn inner_mut(&mut self) -> &mut JsxInner {
        Arc::make_mut(&mut self.0)
    }

    // ------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------

    /// Set a prop.
    pub fn prop(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.inner_mut().props.insert(key.to_string(), value.into());
        self
    }

    /// Set the diff key.
    pub fn key(mut self, key: impl fmt::Display) -> Self {
        self.inner_mut().key = Some(Arc::from(key.to_string()));
        self
    }

    /// Attach an event listener, `event` being e.g. `click` or
    /// `window:resize`.
    pub fn on(self, event: &str, handler: Qrl) -> Self {
        let key = match event.split_once(':') {
            Some((scope, name)) => format!("on-{scope}:{name}"),
            None => format!("on:{event}"),
        };
        self.prop(&key, handler)
    }

    /// Project into the named slot of the parent component.
    pub fn slot(self, name: &str) -> Self {
        self.prop(SLOT_PROP, name)
    }

    /// Append a child. Empty children are dropped.
    pub fn child(mut self, child: impl Into<JsxNode>) -> Self {
        let child = child.into();
        if child.0.kind != JsxKind::Empty {
            self.inner_mut().children.push(child);
        }
        self
    }

    pub fn children<I>(self, children: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<JsxNode>,
    {
        children.into_iter().fold(self, JsxNode::child)
    }
}

/// An element.
pub fn h(tag: &str) -> JsxNode {
    JsxNode::of(JsxKind::Element(Arc::from(tag.to_ascii_lowercase())))
}

pub fn text(value: impl Into<Value>) -> JsxNode {
    JsxNode::of(JsxKind::Text(Arc::from(value.into().to_display_string())))
}

pub fn comment(data: &str) -> JsxNode {
    JsxNode::of(JsxKind::Comment(Arc::from(data)))
}

/// The host marker: its props go onto the component host, its children
/// become the host's children. Only valid as the root of component output.
pub fn host() -> JsxNode {
    JsxNode::of(JsxKind::Host)
}

/// Reuse the existing children of the parent.
pub fn skip() -> JsxNode {
    JsxNode::of(JsxKind::Skip)
}

/// A named slot hole inside component output.
pub fn slot(name: &str) -> JsxNode {
    h(SLOT_TAG).prop("name", name)
}

impl From<Value> for JsxNode {
    fn from(value: Value) -> Self {
        match value {
            Value::Jsx(node) => node,
            Value::Undefined | Value::Null | Value::Bool(_) => JsxNode::of(JsxKind::Empty),
            Value::Mutable(inner) => JsxNode::from((*inner).clone()),
            other => text(other),
        }
    }
}

impl From<&str> for JsxNode {
    fn from(s: &str) -> Self {
        text(s)
    }
}

impl From<String> for JsxNode {
    fn from(s: String) -> Self {
        text(s)
    }
}

impl<T: Into<JsxNode>> From<Option<T>> for JsxNode {
    fn from(node: Option<T>) -> Self {
        node.map(Into::into).unwrap_or_else(|| JsxNode::of(JsxKind::Empty))
    }
}

impl fmt::Debug for JsxNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            JsxKind::Element(tag) => {
                let mut s = f.debug_struct(tag);
                if let Some(key) = &self.0.key {
                    s.field("key", key);
                }
                for (k, v) in &self.0.props {
                    s.field(k, v);
                }
                if !self.0.children.is_empty() {
                    s.field("children", &self.0.children);
                }
                s.finish()
            }
            JsxKind::Text(t) => write!(f, "{t:?}"),
            JsxKind::Comment(c) => write!(f, "<!--{c}-->"),
            kind => write!(f, "{kind:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_collect_props_and_children() {
        let node = h("UL")
            .prop("class", "list")
            .children(["a", "b"].map(|label| h("li").key(label).child(label)));

        assert_eq!(node.tag(), Some("ul"));
        assert_eq!(node.props()["class"].as_str(), Some("list"));
        assert_eq!(node.child_nodes().len(), 2);
        assert_eq!(node.child_nodes()[1].key_str(), Some("b"));
    }

    #[test]
    fn empty_children_are_dropped() {
        let node = h("div")
            .child(Value::Undefined)
            .child(Value::Bool(false))
            .child(None::<JsxNode>)
            .child(Value::from(0));
        assert_eq!(node.child_nodes().len(), 1);
        assert_eq!(node.child_nodes()[0].kind(), &JsxKind::Text(Arc::from("0")));
    }

    #[test]
    fn listener_keys_are_normalized() {
        let qrl = Qrl::lazy("./a.js", "h");
        let node = h("button").on("click", qrl.clone()).on("window:resize", qrl);
        assert!(node.props().contains_key("on:click"));
        assert!(node.props().contains_key("on-window:resize"));
    }

    #[test]
    fn components_carry_their_render_qrl() {
        let node = JsxNode::component("my-counter", Qrl::lazy("./c.js", "Counter"));
        assert!(node.is_component());
        assert_eq!(node.render_qrl().unwrap().symbol(), "Counter");
        assert!(!h("div").is_component());
    }
}
