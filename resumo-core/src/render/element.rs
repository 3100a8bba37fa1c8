//! Element Context
//!
//! Every element that holds runtime state (a component host, or any element
//! with listeners) owns an [`ElementContext`]. It is created lazily by the
//! container on first access and destroyed, after its subscriptions and
//! watches are torn down, when the element leaves the tree.
//!
//! This module also hosts the component hooks. They all read the ambient
//! [`InvokeContext`] and fail with `UseInvokeContext` outside a render.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::container::{ContainerState, StoreOptions};
use crate::dom::Node;
use crate::error::{Error, Result};
use crate::qrl::Qrl;
use crate::reactive::{run_watch, InvokeContext, ProxyFlags, Store, Watch, WatchFlags};
use crate::value::Value;

/// Per-element runtime state.
pub struct ElementContext {
    pub(crate) element: Node,
    /// Needs a re-render.
    pub(crate) dirty: bool,
    /// Objects referenced from serialized listener attributes.
    pub(crate) ref_map: Vec<Value>,
    /// Sequential slots.
    pub(crate) seq: Vec<Value>,
    pub(crate) props: Option<Store>,
    pub(crate) render_qrl: Option<Qrl>,
    /// Listeners keyed by normalized attribute name (`on:click`).
    pub(crate) listeners: IndexMap<String, Vec<Qrl>>,
    /// Values provided to descendants.
    pub(crate) contexts: IndexMap<String, Value>,
    pub(crate) watches: Vec<Watch>,
    /// Nearest enclosing component host.
    pub(crate) parent: Option<Node>,
}

impl ElementContext {
    pub(crate) fn new(element: Node) -> Self {
        Self {
            element,
            dirty: false,
            ref_map: Vec::new(),
            seq: Vec::new(),
            props: None,
            render_qrl: None,
            listeners: IndexMap::new(),
            contexts: IndexMap::new(),
            watches: Vec::new(),
            parent: None,
        }
    }

    pub fn element(&self) -> &Node {
        &self.element
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn props(&self) -> Option<&Store> {
        self.props.as_ref()
    }

    pub fn render_qrl(&self) -> Option<&Qrl> {
        self.render_qrl.as_ref()
    }

    pub fn seq(&self) -> &[Value] {
        &self.seq
    }

    pub fn watches(&self) -> &[Watch] {
        &self.watches
    }

    pub fn listeners(&self) -> &IndexMap<String, Vec<Qrl>> {
        &self.listeners
    }

    pub fn contexts(&self) -> &IndexMap<String, Value> {
        &self.contexts
    }

    /// Index of `value` in the reference map, adding it when absent.
    pub(crate) fn add_ref(&mut self, value: &Value) -> usize {
        if let Some(index) = self.ref_map.iter().position(|v| v.same(value)) {
            return index;
        }
        self.ref_map.push(value.clone());
        self.ref_map.len() - 1
    }

    /// Register `qrl` under `key`, replacing a listener for the same code.
    pub(crate) fn add_listener(&mut self, key: &str, qrl: Qrl) {
        let list = self.listeners.entry(key.to_string()).or_default();
        match list.iter().position(|q| q.is_same(&qrl)) {
            Some(index) => list[index] = qrl,
            None => list.push(qrl),
        }
    }

    /// Whether the context holds anything worth serializing.
    pub(crate) fn has_state(&self) -> bool {
        self.props.is_some()
            || self.render_qrl.is_some()
            || !self.listeners.is_empty()
            || !self.seq.is_empty()
            || !self.watches.is_empty()
            || !self.contexts.is_empty()
    }
}

pub type SharedElementContext = Arc<Mutex<ElementContext>>;

fn host_context(hook: &'static str) -> Result<(InvokeContext, Arc<ContainerState>, Node)> {
    let ctx = InvokeContext::current(hook)?;
    let state = ctx
        .frame()
        .container
        .clone()
        .ok_or(Error::UseInvokeContext(hook))?;
    let host = ctx.frame().host.clone().ok_or(Error::UseInvokeContext(hook))?;
    Ok((ctx, state, host))
}

/// One sequential slot of the current component.
pub struct SequentialScope {
    value: Option<Value>,
    index: usize,
    context: SharedElementContext,
}

impl SequentialScope {
    /// The stored value, `None` on the first render.
    pub fn get(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Store `value` in the slot and return it.
    pub fn set(&self, value: impl Into<Value>) -> Value {
        let value = value.into();
        let mut ctx = self.context.lock();
        if ctx.seq.len() <= self.index {
            ctx.seq.resize(self.index + 1, Value::Undefined);
        }
        ctx.seq[self.index] = value.clone();
        value
    }
}

/// Claim the next sequential slot of the component being rendered.
pub fn use_sequential_scope() -> Result<SequentialScope> {
    let (ctx, state, host) = host_context("use_sequential_scope")?;
    let index = ctx.next_seq();
    let context = state.get_context(&host);
    let value = context.lock().seq.get(index).cloned();
    Ok(SequentialScope {
        value,
        index,
        context,
    })
}

/// A store that survives re-renders of the current component.
pub fn use_store(initial: impl Into<Value>) -> Result<Store> {
    use_store_with(initial, StoreOptions::default())
}

pub fn use_store_with(initial: impl Into<Value>, options: StoreOptions) -> Result<Store> {
    let scope = use_sequential_scope()?;
    if let Some(Value::Store(store)) = scope.get() {
        return Ok(store.clone());
    }
    let state = InvokeContext::current("use_store")?
        .frame()
        .container
        .clone()
        .ok_or(Error::UseInvokeContext("use_store"))?;
    let value = initial.into();
    let target = value
        .as_target()
        .cloned()
        .ok_or_else(|| Error::OnlyObjectWrapped(value.type_name().to_string()))?;
    let mut flags = ProxyFlags::empty();
    if options.recursive {
        flags |= ProxyFlags::RECURSIVE;
    }
    let store = state.get_or_create_proxy(&target, flags);
    scope.set(store.clone());
    Ok(store)
}

fn register_watch(hook: &'static str, qrl: Qrl, flags: WatchFlags) -> Result<Option<(Watch, InvokeContext, Arc<ContainerState>)>> {
    let scope = use_sequential_scope()?;
    if scope.get().is_some() {
        return Ok(None);
    }
    let (ctx, state, host) = host_context(hook)?;
    let watch = {
        let context = state.get_context(&host);
        let mut context = context.lock();
        let watch = Watch::new(host.clone(), context.watches.len(), qrl, flags);
        context.watches.push(watch.clone());
        watch
    };
    scope.set(watch.index());
    Ok(Some((watch, ctx, state)))
}

/// Register a watch that runs now (the render awaits it) and again before
/// the DOM patch whenever a store it read changes.
pub fn use_watch(qrl: Qrl) -> Result<()> {
    if let Some((watch, ctx, state)) =
        register_watch("use_watch", qrl, WatchFlags::IS_WATCH | WatchFlags::IS_DIRTY)?
    {
        ctx.wait_on(run_watch(watch, state));
    }
    Ok(())
}

/// Register an effect that runs after the DOM commit of the pass that
/// rendered its host. Never runs on a server.
pub fn use_client_effect(qrl: Qrl) -> Result<()> {
    if let Some((watch, _, state)) = register_watch("use_client_effect", qrl, WatchFlags::IS_EFFECT)? {
        if !state.platform().is_server() && watch.mark_dirty() {
            state.notify_watch(&watch);
        }
    }
    Ok(())
}

/// Provide `value` under `key` to this component and its descendants.
pub fn use_context_provider(key: &str, value: impl Into<Value>) -> Result<()> {
    let (_, state, host) = host_context("use_context_provider")?;
    state
        .get_context(&host)
        .lock()
        .contexts
        .insert(key.to_string(), value.into());
    Ok(())
}

/// Look `key` up in the current component and its ancestors.
pub fn use_context(key: &str) -> Result<Option<Value>> {
    let (_, state, host) = host_context("use_context")?;
    let mut current = Some(host);
    while let Some(node) = current {
        let parent = match state.try_context(&node) {
            Some(context) => {
                let context = context.lock();
                if let Some(value) = context.contexts.get(key) {
                    return Ok(Some(value.clone()));
                }
                context.parent.clone()
            }
            None => None,
        };
        current = parent.or_else(|| {
            node.parent()
                .and_then(|p| p.closest(|n| n.has_attribute("q:host")))
        });
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;

    #[test]
    fn listeners_merge_by_code_identity() {
        let el = Document::new().create_element("button");
        let mut ctx = ElementContext::new(el);
        let first = Qrl::lazy("./a.js", "click");
        ctx.add_listener("on:click", first.clone());
        ctx.add_listener("on:click", first.with_capture(vec![Value::from(1)]));
        ctx.add_listener("on:click", Qrl::lazy("./a.js", "other"));

        let list = &ctx.listeners["on:click"];
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].captured().len(), 1);
    }

    #[test]
    fn ref_map_dedupes_by_identity() {
        let el = Document::new().create_element("div");
        let mut ctx = ElementContext::new(el);
        let obj = Value::object([("a", Value::from(1))]);
        assert_eq!(ctx.add_ref(&obj), 0);
        assert_eq!(ctx.add_ref(&Value::from(2)), 1);
        assert_eq!(ctx.add_ref(&obj.clone()), 0);
        assert_eq!(ctx.ref_map.len(), 2);
    }

    #[test]
    fn hooks_require_an_invocation() {
        assert!(matches!(
            use_sequential_scope(),
            Err(Error::UseInvokeContext("use_sequential_scope"))
        ));
        assert!(use_context("theme").is_err());
    }

    #[test]
    fn watch_hooks_fail_outside_a_component() {
        let qrl = Qrl::lazy("./w.js", "watch");
        assert!(matches!(use_watch(qrl.clone()), Err(Error::UseInvokeContext(_))));
        assert!(matches!(use_client_effect(qrl), Err(Error::UseInvokeContext(_))));
    }
}
