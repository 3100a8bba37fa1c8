//! Serializer
//!
//! Pausing runs in two phases over a worklist, never by recursion:
//!
//! 1. **Collect**: starting from the context of every element with state,
//!    assign each reachable object an index in discovery order. Objects are
//!    de-duplicated by identity (targets by id, QRLs and watches by handle,
//!    primitives by value), which also breaks cycles.
//! 2. **Emit**: write every object with nested values replaced by
//!    references, then the element metadata and the proxy metadata.
//!
//! Watches are torn down once the payload is complete.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{json, Map};

use crate::container::ContainerState;
use crate::dom::Node;
use crate::error::Result;
use crate::qrl::stringify_qrl;
use crate::reactive::{Subscriber, Watch, WatchId};
use crate::render::SharedElementContext;
use crate::value::{TargetData, TargetId, Value};

use super::payload::{
    encode_id, SnapshotMeta, SnapshotPayload, SnapshotSubs, DOCUMENT, ELEMENT_PREFIX,
    MUTABLE_SUFFIX, QRL_PREFIX, STORE_SUFFIX, UNDEFINED, WATCH_PREFIX,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ObjKey {
    Target(TargetId),
    Qrl(usize),
    Watch(WatchId),
    Str(Arc<str>),
    Num(u64),
    Bool(bool),
    Null,
}

#[derive(Clone)]
enum Obj {
    Value(Value),
    Watch(Watch),
}

fn obj_key(value: &Value) -> Option<(ObjKey, Value)> {
    let key = match value {
        Value::Store(store) => {
            return Some((
                ObjKey::Target(store.target().id()),
                Value::Object(store.target().clone()),
            ))
        }
        Value::Mutable(inner) => return obj_key(inner),
        Value::Object(target) => ObjKey::Target(target.id()),
        Value::Qrl(qrl) => ObjKey::Qrl(qrl.addr()),
        Value::String(s) => ObjKey::Str(s.clone()),
        Value::Number(n) => ObjKey::Num(n.to_bits()),
        Value::Bool(b) => ObjKey::Bool(*b),
        Value::Null => ObjKey::Null,
        _ => return None,
    };
    Some((key, value.clone()))
}

/// Written inline when nested in an object or array.
fn is_inline(value: &Value) -> bool {
    matches!(value, Value::Number(_) | Value::Bool(_) | Value::Null)
}

fn number_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        json!(n as i64)
    } else if n.is_finite() {
        serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
    } else {
        tracing::warn!(value = %n, "non-finite number written as null");
        serde_json::Value::Null
    }
}

struct Collector<'a> {
    state: &'a Arc<ContainerState>,
    objs: Vec<Obj>,
    index: HashMap<ObjKey, usize>,
    queue: VecDeque<usize>,
}

impl<'a> Collector<'a> {
    fn new(state: &'a Arc<ContainerState>) -> Self {
        Self {
            state,
            objs: Vec::new(),
            index: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn add(&mut self, key: ObjKey, obj: Obj) {
        if self.index.contains_key(&key) {
            return;
        }
        let index = self.objs.len();
        self.objs.push(obj);
        self.index.insert(key, index);
        self.queue.push_back(index);
    }

    fn discover(&mut self, value: &Value) {
        if let Some((key, value)) = obj_key(value) {
            self.add(key, Obj::Value(value));
        }
    }

    fn discover_watch(&mut self, watch: &Watch) {
        self.add(ObjKey::Watch(watch.id()), Obj::Watch(watch.clone()));
    }

    /// Follow nested values, QRL captures and watch bodies.
    fn drain(&mut self) {
        while let Some(index) = self.queue.pop_front() {
            match self.objs[index].clone() {
                Obj::Value(Value::Object(target)) => {
                    for value in target.values().iter().filter(|v| !is_inline(v)) {
                        self.discover(value);
                    }
                }
                Obj::Value(Value::Qrl(qrl)) => {
                    for value in qrl.captured() {
                        self.discover(&value);
                    }
                }
                Obj::Watch(watch) => self.discover(&Value::Qrl(watch.qrl().clone())),
                Obj::Value(_) => {}
            }
        }
    }

    fn id_of(&self, key: &ObjKey) -> Option<String> {
        self.index.get(key).map(|&index| encode_id(index))
    }

    /// Reference to an element, assigning its `q:id` when needed.
    fn element_ref(&self, node: &Node) -> String {
        if node.is_document() {
            return DOCUMENT.to_string();
        }
        if !node.is_connected() {
            if self.state.config.dev {
                tracing::warn!(?node, "cannot serialize a disconnected element");
            }
            return UNDEFINED.to_string();
        }
        if node.owner_document().as_ref() != Some(self.state.document()) {
            if self.state.config.dev {
                tracing::warn!(?node, "cannot serialize an element of another document");
            }
            return UNDEFINED.to_string();
        }
        let id = match node.get_attribute("q:id") {
            Some(id) => id,
            None => {
                let id = self.state.next_element_id();
                node.set_attribute("q:id", &id);
                id
            }
        };
        format!("{ELEMENT_PREFIX}{id}")
    }

    fn ref_of(&self, value: &Value) -> String {
        match value {
            Value::Undefined => UNDEFINED.to_string(),
            Value::Node(node) => self.element_ref(node),
            Value::Function(_) | Value::Jsx(_) => {
                if self.state.config.dev {
                    tracing::warn!(kind = value.type_name(), "value is not serializable");
                }
                UNDEFINED.to_string()
            }
            Value::Mutable(inner) => match obj_key(inner).and_then(|(key, _)| self.id_of(&key)) {
                Some(id) => format!("{id}{MUTABLE_SUFFIX}"),
                None => self.ref_of(inner),
            },
            Value::Store(store) => match self.id_of(&ObjKey::Target(store.target().id())) {
                Some(id) => format!("{id}{STORE_SUFFIX}"),
                None => UNDEFINED.to_string(),
            },
            _ => obj_key(value)
                .and_then(|(key, _)| self.id_of(&key))
                .unwrap_or_else(|| UNDEFINED.to_string()),
        }
    }

    fn watch_ref(&self, watch: &Watch) -> Option<String> {
        self.id_of(&ObjKey::Watch(watch.id()))
    }

    fn nested(&self, value: &Value) -> serde_json::Value {
        match value {
            Value::Number(n) => number_json(*n),
            Value::Bool(b) => json!(b),
            Value::Null => serde_json::Value::Null,
            other => json!(self.ref_of(other)),
        }
    }

    fn emit(&self, obj: &Obj) -> Result<serde_json::Value> {
        let platform = self.state.platform();
        let value = match obj {
            Obj::Watch(watch) => {
                let qrl = self.ref_of(&Value::Qrl(watch.qrl().clone()));
                json!(format!(
                    "{WATCH_PREFIX}{} {} {qrl}",
                    watch.flags().bits(),
                    self.element_ref(watch.host()),
                ))
            }
            Obj::Value(Value::Object(target)) => match target.data() {
                TargetData::Object(map) => {
                    let map: Map<String, serde_json::Value> = map
                        .iter()
                        .map(|(k, v)| (k.clone(), self.nested(v)))
                        .collect();
                    serde_json::Value::Object(map)
                }
                TargetData::Array(items) => {
                    serde_json::Value::Array(items.iter().map(|v| self.nested(v)).collect())
                }
            },
            Obj::Value(Value::Qrl(qrl)) => {
                let ids: Vec<String> = qrl.captured().iter().map(|v| self.ref_of(v)).collect();
                let text = stringify_qrl(qrl, Some(platform.as_ref()), &ids)?;
                json!(format!("{QRL_PREFIX}{text}"))
            }
            Obj::Value(Value::String(s)) => serde_json::Value::String(s.to_string()),
            Obj::Value(Value::Number(n)) => number_json(*n),
            Obj::Value(Value::Bool(b)) => json!(b),
            Obj::Value(_) => serde_json::Value::Null,
        };
        Ok(value)
    }

    /// Proxy metadata, when the object is a store with flags or subscribers.
    fn subs_of(&self, obj: &Obj) -> Option<SnapshotSubs> {
        let Obj::Value(Value::Object(target)) = obj else {
            return None;
        };
        let store = self.state.proxy_for(target.id())?;
        let entries = self
            .state
            .subs
            .try_get_local(target.id())
            .map(|local| local.snapshot())
            .unwrap_or_default();
        if store.flags().is_empty() && entries.is_empty() {
            return None;
        }
        let mut s = Vec::new();
        for entry in entries {
            let subscriber = match &entry.subscriber {
                Subscriber::Host(host) => Some(self.element_ref(host)),
                Subscriber::Watch(watch) => self.watch_ref(watch),
            };
            let Some(subscriber) = subscriber.filter(|r| r != UNDEFINED) else {
                continue;
            };
            let mut parts = vec![subscriber];
            if let Some(keys) = &entry.keys {
                parts.extend(keys.iter().map(|k| k.to_string()));
            }
            s.push(parts.join(" "));
        }
        Some(SnapshotSubs {
            f: store.flags().bits(),
            s,
        })
    }
}

fn join_refs<'v>(collector: &Collector<'_>, values: impl Iterator<Item = &'v Value>) -> Option<String> {
    let refs: Vec<String> = values.map(|v| collector.ref_of(v)).collect();
    (!refs.is_empty()).then(|| refs.join(" "))
}

/// Elements of the container holding state, in document order.
fn stateful_elements(state: &ContainerState) -> Vec<(Node, SharedElementContext)> {
    let root = state.element();
    std::iter::once(root.clone())
        .chain(root.descendants())
        .filter(Node::is_element)
        .filter_map(|el| {
            let context = state.try_context(&el)?;
            let has_state = context.lock().has_state();
            has_state.then_some((el, context))
        })
        .collect()
}

/// Rewrite listener attributes so their captures index the reference map.
fn serialize_listeners(state: &ContainerState, el: &Node, context: &SharedElementContext) -> Result<()> {
    let platform = state.platform();
    let mut context = context.lock();
    let listeners = context.listeners.clone();
    for (key, qrls) in listeners {
        let mut lines = Vec::with_capacity(qrls.len());
        for qrl in &qrls {
            let ids: Vec<String> = qrl
                .captured()
                .iter()
                .map(|v| context.add_ref(v).to_string())
                .collect();
            lines.push(stringify_qrl(qrl, Some(platform.as_ref()), &ids)?);
        }
        el.set_attribute(&key, &lines.join("\n"));
    }
    Ok(())
}

fn write_script(state: &ContainerState, payload: &SnapshotPayload) -> Result<()> {
    let container = state.element();
    let script_type = &state.config.payload_type;
    for child in container.children() {
        if child.is_tag("script") && child.get_attribute("type").as_deref() == Some(script_type) {
            child.remove();
        }
    }
    let doc = state.document();
    let script = doc.create_element("script");
    script.set_attribute("type", script_type);
    script.append_child(&doc.create_text(&payload.to_script_text()?));
    container.append_child(&script);
    Ok(())
}

/// Serialize the container state into the DOM and return the payload.
pub(crate) async fn pause_container(state: &Arc<ContainerState>) -> Result<SnapshotPayload> {
    state.flush().await;
    let container = state.element();
    if container.get_attribute("q:container").as_deref() == Some("paused") {
        tracing::warn!("container is already paused, serializing again");
    }

    let elements = stateful_elements(state);
    for (el, context) in &elements {
        serialize_listeners(state, el, context)?;
    }

    let mut collector = Collector::new(state);
    for (_, context) in &elements {
        let context = context.lock();
        if let Some(props) = &context.props {
            collector.discover(&Value::Store(props.clone()));
        }
        if let Some(render) = &context.render_qrl {
            collector.discover(&Value::Qrl(render.clone()));
        }
        for value in context.ref_map.iter().chain(&context.seq).chain(context.contexts.values()) {
            collector.discover(value);
        }
        for watch in &context.watches {
            collector.discover_watch(watch);
        }
    }
    collector.drain();
    tracing::debug!(elements = elements.len(), objs = collector.objs.len(), "pausing");

    let mut payload = SnapshotPayload::default();
    let mut watches = Vec::new();
    for (el, context) in &elements {
        let id = collector.element_ref(el);
        let Some(id) = id.strip_prefix(ELEMENT_PREFIX) else {
            continue;
        };
        let context = context.lock();
        let mut meta = SnapshotMeta {
            r: join_refs(&collector, context.ref_map.iter()),
            s: join_refs(&collector, context.seq.iter()),
            ..Default::default()
        };
        if context.props.is_some() || context.render_qrl.is_some() {
            let props = context.props.clone().map(Value::Store).unwrap_or_default();
            let render = context.render_qrl.clone().map(Value::Qrl).unwrap_or_default();
            meta.h = Some(format!("{} {}", collector.ref_of(&props), collector.ref_of(&render)));
        }
        let watch_refs: Vec<String> = context
            .watches
            .iter()
            .filter_map(|w| collector.watch_ref(w))
            .collect();
        if !watch_refs.is_empty() {
            meta.w = Some(watch_refs.join(" "));
        }
        if !context.contexts.is_empty() {
            let pairs: Vec<String> = context
                .contexts
                .iter()
                .map(|(key, value)| format!("{key}={}", collector.ref_of(value)))
                .collect();
            meta.c = Some(pairs.join(" "));
        }
        for watch in &context.watches {
            if watch.is_dirty() && state.config.dev {
                tracing::warn!(?watch, "serializing a dirty watch");
            }
        }
        watches.extend(context.watches.iter().cloned());
        payload.ctx.insert(id.to_string(), meta);
    }

    for obj in &collector.objs {
        payload.objs.push(collector.emit(obj)?);
        payload.subs.push(collector.subs_of(obj));
    }

    for watch in watches {
        state.unschedule(&Subscriber::Watch(watch.clone()));
        watch.destroy(state).await;
    }

    write_script(state, &payload)?;
    container.set_attribute("q:container", "paused");
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::dom::Document;
    use crate::platform::ModulePlatform;
    use crate::qrl::Qrl;
    use crate::reactive::ProxyFlags;
    use crate::value::mutable;

    fn setup() -> Container {
        let doc = Document::new();
        let body = doc.body().unwrap();
        Container::new(&body, Arc::new(ModulePlatform::new()), Default::default())
    }

    #[tokio::test]
    async fn shared_objects_are_serialized_once() {
        let container = setup();
        let state = container.state();
        let host = container.document().create_element("div");
        container.element().append_child(&host);

        let shared = Value::object([("n", Value::from(1))]);
        let store = container.create_store(Value::object([("x", shared.clone()), ("y", shared)]), Default::default()).unwrap();
        state.get_context(&host).lock().seq.push(Value::Store(store));

        let payload = pause_container(state).await.unwrap();
        assert_eq!(payload.objs.len(), 2);
        assert_eq!(payload.objs[0], json!({"x": "1", "y": "1"}));
        assert_eq!(payload.objs[1], json!({"n": 1}));
        assert_eq!(payload.ctx["0"].s.as_deref(), Some("0!"));
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let container = setup();
        let state = container.state();
        let host = container.document().create_element("div");
        container.element().append_child(&host);

        let a = crate::value::Target::object();
        let b = crate::value::Target::object();
        a.set("b", Value::Object(b.clone()));
        b.set("a", Value::Object(a.clone()));
        state.get_context(&host).lock().seq.push(Value::Object(a));

        let payload = pause_container(state).await.unwrap();
        assert_eq!(payload.objs, vec![json!({"b": "1"}), json!({"a": "0"})]);
    }

    #[tokio::test]
    async fn sentinels_and_suffixes() {
        let container = setup();
        let state = container.state();
        let host = container.document().create_element("div");
        container.element().append_child(&host);
        let detached = container.document().create_element("p");

        let obj = Value::object([
            ("u", Value::Undefined),
            ("d", Value::Node(container.document().node().clone())),
            ("e", Value::Node(host.clone())),
            ("gone", Value::Node(detached)),
            ("m", mutable("text")),
            ("q", Value::Qrl(Qrl::lazy("./a.js", "default"))),
        ]);
        state.get_context(&host).lock().seq.push(obj);

        let payload = pause_container(state).await.unwrap();
        let host_id = host.get_attribute("q:id").unwrap();
        assert_eq!(
            payload.objs[0],
            json!({
                "u": UNDEFINED,
                "d": DOCUMENT,
                "e": format!("#{host_id}"),
                "gone": UNDEFINED,
                "m": "1%",
                "q": "2",
            })
        );
        assert_eq!(payload.objs[1], json!("text"));
        assert_eq!(payload.objs[2], json!(format!("{QRL_PREFIX}./a.js")));
    }

    #[tokio::test]
    async fn proxy_metadata_records_flags_and_subscribers() {
        let container = setup();
        let state = container.state();
        let host = container.document().create_element("div");
        container.element().append_child(&host);
        let target = crate::value::Target::from_entries([("a", Value::from(1))]);
        let props = state.get_or_create_proxy(&target, ProxyFlags::IMMUTABLE);
        let store = container.create_store(Value::object([("c", Value::from(0))]), Default::default()).unwrap();
        state.subs.add_sub(store.target().id(), Subscriber::Host(host.clone()), Some("c"));
        {
            let context = state.get_context(&host);
            let mut context = context.lock();
            context.props = Some(props);
            context.seq.push(Value::Store(store));
        }

        let payload = pause_container(state).await.unwrap();
        let host_id = host.get_attribute("q:id").unwrap();
        assert_eq!(payload.subs[0], Some(SnapshotSubs { f: 2, s: vec![] }));
        assert_eq!(
            payload.subs[1],
            Some(SnapshotSubs {
                f: 0,
                s: vec![format!("#{host_id} c")],
            })
        );
        assert_eq!(payload.ctx[&host_id].h.as_deref(), Some(format!("0! {UNDEFINED}").as_str()));
        assert_eq!(container.element().get_attribute("q:container").as_deref(), Some("paused"));
    }

    #[tokio::test]
    async fn listener_captures_move_into_the_ref_map() {
        let container = setup();
        let state = container.state();
        let button = container.document().create_element("button");
        container.element().append_child(&button);
        let captured = Value::object([("k", Value::from(3))]);
        let qrl = Qrl::lazy("./a.js", "onClick").with_capture(vec![captured]);
        state.get_context(&button).lock().add_listener("on:click", qrl);

        let payload = pause_container(state).await.unwrap();
        assert_eq!(button.get_attribute("on:click").as_deref(), Some("./a.js#onClick[0]"));
        let id = button.get_attribute("q:id").unwrap();
        assert_eq!(payload.ctx[&id].r.as_deref(), Some("0"));
        assert_eq!(payload.objs[0], json!({"k": 3}));
    }
}
