//! Containers
//!
//! A container is the DOM subtree under which reactive state, scheduling
//! and serialization apply. [`ContainerState`] is everything the runtime
//! shares across the components of one container: the proxy registry, the
//! subscription tables, element contexts, the pending work of the scheduler
//! and the platform.
//!
//! [`Container`] is the public handle: it renders trees, dispatches events,
//! creates stores and pauses the container into a serialized payload.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::dom::{Document, Node, NodeId};
use crate::error::Result;
use crate::pause::payload::encode_id;
use crate::pause::{pause_container, resume_container, SnapshotPayload};
use crate::platform::Platform;
use crate::qrl::{parse_qrl, Qrl};
use crate::reactive::{
    wrap, InvokeContext, InvokeFrame, ProxyFlags, Store, Subscriber, SubscriptionManager,
};
use crate::render::element::{ElementContext, SharedElementContext};
use crate::render::scheduler::{render_root, SchedState};
use crate::render::{DomOp, JsxNode};
use crate::value::{Target, TargetId, Value};

/// Options of [`Container::create_store`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Wrap nested objects and arrays on read.
    pub recursive: bool,
}

/// Shared state of one container.
pub struct ContainerState {
    platform: Arc<dyn Platform>,
    pub(crate) config: RuntimeConfig,
    document: Document,
    element: Node,
    proxy_map: DashMap<TargetId, Store>,
    pub(crate) subs: SubscriptionManager,
    contexts: DashMap<NodeId, SharedElementContext>,
    /// Props last applied to each element, committed at the end of a pass.
    prop_cache: DashMap<NodeId, IndexMap<String, Value>>,
    pub(crate) sched: Mutex<SchedState>,
    element_ids: AtomicU64,
    passes: AtomicUsize,
    last_ops: Mutex<Vec<DomOp>>,
}

impl ContainerState {
    fn new(element: &Node, platform: Arc<dyn Platform>, config: RuntimeConfig) -> Self {
        let document = element.owner_document().unwrap_or_default();
        Self {
            platform,
            config,
            document,
            element: element.clone(),
            proxy_map: DashMap::new(),
            subs: SubscriptionManager::new(),
            contexts: DashMap::new(),
            prop_cache: DashMap::new(),
            sched: Mutex::new(SchedState::default()),
            element_ids: AtomicU64::new(0),
            passes: AtomicUsize::new(0),
            last_ops: Mutex::new(Vec::new()),
        }
    }

    pub fn platform(&self) -> Arc<dyn Platform> {
        self.platform.clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// The container element.
    pub fn element(&self) -> &Node {
        &self.element
    }

    /// Module base URL: the container's `q:base`, else the configured one.
    pub fn base_url(&self) -> Option<String> {
        self.element
            .get_attribute("q:base")
            .or_else(|| self.config.base.clone())
    }

    // ------------------------------------------------------------------
    // Stores
    // ------------------------------------------------------------------

    /// The proxy registered for `target`, created with `flags` when there is
    /// none yet.
    pub fn get_or_create_proxy(self: &Arc<Self>, target: &Target, flags: ProxyFlags) -> Store {
        if let Some(store) = self.proxy_map.get(&target.id()) {
            return store.clone();
        }
        self.subs.get_local(target.id(), None);
        self.proxy_map
            .entry(target.id())
            .or_insert_with(|| Store::new(target.clone(), flags, Arc::downgrade(self)))
            .clone()
    }

    /// The proxy registered for `target`, if any.
    pub fn proxy_for(&self, target: TargetId) -> Option<Store> {
        self.proxy_map.get(&target).map(|store| store.clone())
    }

    /// Route a change notification to the scheduler.
    pub(crate) fn notify_change(self: &Arc<Self>, subscriber: &Subscriber) {
        match subscriber {
            Subscriber::Host(host) => self.notify_render(host),
            Subscriber::Watch(watch) => {
                if watch.mark_dirty() {
                    self.notify_watch(watch);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Element contexts
    // ------------------------------------------------------------------

    /// The context of `node`, created on first access.
    pub fn get_context(&self, node: &Node) -> SharedElementContext {
        self.contexts
            .entry(node.id())
            .or_insert_with(|| Arc::new(Mutex::new(ElementContext::new(node.clone()))))
            .clone()
    }

    pub fn try_context(&self, node: &Node) -> Option<SharedElementContext> {
        self.contexts.get(&node.id()).map(|ctx| ctx.clone())
    }

    pub(crate) fn remove_context(&self, node: &Node) -> Option<SharedElementContext> {
        self.contexts.remove(&node.id()).map(|(_, ctx)| ctx)
    }

    pub(crate) fn is_dirty(&self, host: &Node) -> bool {
        self.try_context(host).is_some_and(|ctx| ctx.lock().dirty)
    }

    // ------------------------------------------------------------------
    // Prop cache
    // ------------------------------------------------------------------

    pub(crate) fn cached_prop(&self, node: &Node, key: &str) -> Option<Value> {
        self.prop_cache
            .get(&node.id())
            .and_then(|props| props.get(key).cloned())
    }

    pub(crate) fn store_cached_props(&self, node: NodeId, props: IndexMap<String, Value>) {
        self.prop_cache.entry(node).or_default().extend(props);
    }

    pub(crate) fn forget_props(&self, node: &Node) {
        self.prop_cache.remove(&node.id());
    }

    // ------------------------------------------------------------------
    // Element ids
    // ------------------------------------------------------------------

    /// Allocate the next `q:id`.
    pub(crate) fn next_element_id(&self) -> String {
        encode_id(self.element_ids.fetch_add(1, Ordering::SeqCst) as usize)
    }

    /// Make sure future ids are allocated past `next`.
    pub(crate) fn reserve_element_ids(&self, next: u64) {
        self.element_ids.fetch_max(next, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub(crate) fn passes(&self) -> usize {
        self.passes.load(Ordering::SeqCst)
    }

    pub(crate) fn record_pass(&self, ops: Vec<DomOp>) {
        self.passes.fetch_add(1, Ordering::SeqCst);
        *self.last_ops.lock() = ops;
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Listeners of `el` for the attribute `key` (`on:click`). Listeners
    /// known only from a serialized attribute are parsed once, their
    /// captures taken from the element's reference map.
    fn listeners_for(&self, el: &Node, key: &str) -> Result<Vec<Qrl>> {
        if let Some(context) = self.try_context(el) {
            if let Some(list) = context.lock().listeners.get(key) {
                if !list.is_empty() {
                    return Ok(list.clone());
                }
            }
        }
        let Some(attr) = el.get_attribute(key) else {
            return Ok(Vec::new());
        };
        let context = self.get_context(el);
        let mut context = context.lock();
        let mut list = Vec::new();
        for line in attr.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let qrl = parse_qrl(line)?;
            let captured: Vec<Value> = qrl
                .capture_ids()
                .iter()
                .map(|id| {
                    id.parse::<usize>()
                        .ok()
                        .and_then(|index| context.ref_map.get(index).cloned())
                        .unwrap_or_default()
                })
                .collect();
            if !captured.is_empty() {
                qrl.set_captured(captured);
            }
            list.push(qrl);
        }
        context.listeners.insert(key.to_string(), list.clone());
        Ok(list)
    }

    async fn run_listeners(self: &Arc<Self>, el: &Node, key: &str, event: &str) -> Result<()> {
        let handlers = self.listeners_for(el, key)?;
        if handlers.is_empty() {
            return Ok(());
        }
        let host = el.closest(|n| n.has_attribute("q:host"));
        let mut first_err = None;
        for qrl in handlers {
            tracing::debug!(?el, event, ?qrl, "dispatching");
            let ctx = InvokeContext::new(InvokeFrame {
                container: Some(self.clone()),
                document: Some(self.document.clone()),
                host: host.clone(),
                element: Some(el.clone()),
                event: Some(Arc::from(event)),
                url: self.base_url().map(Arc::from),
                ..Default::default()
            });
            let args = vec![Value::from(event), Value::Node(el.clone())];
            let result = qrl.invoke(ctx.clone(), args).await;
            let waited = ctx.wait_all().await;
            if let Err(err) = result.and(waited) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Handle to a container.
#[derive(Clone)]
pub struct Container {
    state: Arc<ContainerState>,
}

impl Container {
    /// Attach a container to `element`.
    pub fn new(element: &Node, platform: Arc<dyn Platform>, config: RuntimeConfig) -> Self {
        if let Some(base) = &config.base {
            if !element.has_attribute("q:base") {
                element.set_attribute("q:base", base);
            }
        }
        Self {
            state: Arc::new(ContainerState::new(element, platform, config)),
        }
    }

    pub fn state(&self) -> &Arc<ContainerState> {
        &self.state
    }

    pub fn element(&self) -> &Node {
        self.state.element()
    }

    pub fn document(&self) -> &Document {
        self.state.document()
    }

    /// Wrap `initial` in a store of this container.
    pub fn create_store(&self, initial: impl Into<Value>, options: StoreOptions) -> Result<Store> {
        let mut flags = ProxyFlags::empty();
        if options.recursive {
            flags |= ProxyFlags::RECURSIVE;
        }
        wrap(&initial.into(), flags, &self.state)
    }

    /// Render `tree` into `parent` and wait until every effect it triggered
    /// has settled.
    pub async fn render(&self, parent: &Node, tree: impl Into<JsxNode>) -> Result<()> {
        render_root(self.state.clone(), parent.clone(), tree.into()).await?;
        self.flush().await;
        Ok(())
    }

    /// Dispatch `event` at `target`, bubbling through its ancestors. Every
    /// handler runs; the first failure is returned once all have settled.
    pub async fn dispatch(&self, target: &Node, event: &str) -> Result<()> {
        let key = format!("on:{event}");
        let mut first_err = None;
        let mut current = Some(target.clone());
        while let Some(el) = current {
            if el.is_element() {
                if let Err(err) = self.state.run_listeners(&el, &key, event).await {
                    first_err.get_or_insert(err);
                }
            }
            current = el.parent();
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Dispatch a document- or window-level `event` to every element of the
    /// container listening for it.
    pub async fn dispatch_global(&self, scope: GlobalScope, event: &str) -> Result<()> {
        let key = match scope {
            GlobalScope::Document => format!("on-document:{event}"),
            GlobalScope::Window => format!("on-window:{event}"),
        };
        let mut targets = vec![self.element().clone()];
        targets.extend(self.element().descendants());
        let mut first_err = None;
        for el in targets.into_iter().filter(|n| n.has_attribute(&key)) {
            if let Err(err) = self.state.run_listeners(&el, &key, event).await {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Serialize the container's state into its DOM and return the payload.
    /// Watches of the container are destroyed; the container is marked
    /// `paused`.
    pub async fn pause(&self) -> Result<SnapshotPayload> {
        pause_container(&self.state).await
    }

    /// Attach a container to a paused `element` and revive its state.
    pub fn resume(element: &Node, platform: Arc<dyn Platform>, config: RuntimeConfig) -> Result<Self> {
        resume_container(element, platform, config)
    }

    /// Wait until no render pass is pending.
    pub async fn flush(&self) {
        self.state.flush().await;
    }

    /// Render passes committed so far.
    pub fn render_passes(&self) -> usize {
        self.state.passes()
    }

    /// Operations committed by the latest pass.
    pub fn last_ops(&self) -> Vec<DomOp> {
        self.state.last_ops.lock().clone()
    }
}

/// Scope of a global listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalScope {
    Document,
    Window,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ModulePlatform;
    use crate::value::Func;
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Container, Node) {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let root = doc.create_element("div");
        body.append_child(&root);
        let container = Container::new(&root, Arc::new(ModulePlatform::new()), Default::default());
        (container, root)
    }

    fn counter_handler(calls: &Arc<AtomicUsize>) -> Qrl {
        let calls = calls.clone();
        Qrl::new(
            "./h.js",
            "handler",
            Func::sync(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Undefined)
            }),
        )
    }

    #[test]
    fn configured_base_is_written_once() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let config = RuntimeConfig {
            base: Some("/build/".into()),
            ..Default::default()
        };
        let container = Container::new(&body, Arc::new(ModulePlatform::new()), config);
        assert_eq!(container.element().get_attribute("q:base").as_deref(), Some("/build/"));
        assert_eq!(container.state().base_url().as_deref(), Some("/build/"));
    }

    #[test]
    fn proxies_are_registered_once() {
        let (container, _) = setup();
        let target = Target::from_entries([("a", Value::from(1))]);
        let first = container.state().get_or_create_proxy(&target, ProxyFlags::empty());
        let second = container.state().get_or_create_proxy(&target, ProxyFlags::RECURSIVE);
        assert!(first.ptr_eq(&second));
        assert!(container.state().proxy_for(target.id()).is_some());
    }

    #[test]
    fn element_ids_are_base36() {
        let (container, _) = setup();
        let state = container.state();
        state.reserve_element_ids(35);
        assert_eq!(state.next_element_id(), "z");
        assert_eq!(state.next_element_id(), "10");
    }

    #[tokio::test]
    async fn events_bubble_to_ancestors() {
        let (container, root) = setup();
        let button = container.document().create_element("button");
        root.append_child(&button);
        let calls = Arc::new(AtomicUsize::new(0));
        container
            .state()
            .get_context(&root)
            .lock()
            .add_listener("on:click", counter_handler(&calls));
        container
            .state()
            .get_context(&button)
            .lock()
            .add_listener("on:click", counter_handler(&calls));

        container.dispatch(&button, "click").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn serialized_listeners_take_captures_from_the_ref_map() {
        let doc = Document::new();
        let root = doc.body().unwrap();
        let platform = ModulePlatform::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        platform.register(
            "./app.js",
            "onClick",
            Func::sync(move |_| {
                let scope = crate::reactive::use_lexical_scope()?;
                sink.lock().extend(scope);
                Ok(Value::Undefined)
            }),
        );
        let container = Container::new(&root, Arc::new(platform), Default::default());
        let button = doc.create_element("button");
        root.append_child(&button);
        button.set_attribute("on:click", "./app.js#onClick[1]");
        container
            .state()
            .get_context(&button)
            .lock()
            .ref_map
            .extend([Value::from("zero"), Value::from("one")]);

        container.dispatch(&button, "click").await.unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_str(), Some("one"));
    }

    #[tokio::test]
    async fn global_listeners_are_dispatched_by_scope() {
        let (container, root) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        root.set_attribute("on-window:resize", "./h.js#handler");
        container
            .state()
            .get_context(&root)
            .lock()
            .add_listener("on-window:resize", counter_handler(&calls));

        container.dispatch_global(GlobalScope::Document, "resize").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        container.dispatch_global(GlobalScope::Window, "resize").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
