//! Reviver
//!
//! Resuming rebuilds a container's runtime state from the payload embedded
//! in its DOM, without running any component:
//!
//! 1. Map every `q:id` in the container to its element.
//! 2. Create a live shell for every object: primitives, empty targets,
//!    parsed QRLs.
//! 3. Recreate watches, then seed the subscription tables of every proxy
//!    from `subs`.
//! 4. Fill the target shells and QRL captures, replacing references with
//!    live values.
//! 5. Re-attach every element context from `ctx`.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::config::RuntimeConfig;
use crate::container::{Container, ContainerState};
use crate::dom::Node;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::qrl::parse_qrl;
use crate::reactive::{ProxyFlags, SubEntry, Subscriber, Watch, WatchFlags};
use crate::value::{Target, TargetData, Value};

use super::payload::{
    decode_id, SnapshotMeta, SnapshotPayload, DOCUMENT, ELEMENT_PREFIX, MUTABLE_SUFFIX,
    QRL_PREFIX, STORE_SUFFIX, UNDEFINED, WATCH_PREFIX,
};

struct Reviver<'a> {
    state: &'a Arc<ContainerState>,
    payload: &'a SnapshotPayload,
    elements: HashMap<String, Node>,
    values: Vec<Value>,
    watches: HashMap<usize, Watch>,
    flags: HashMap<usize, ProxyFlags>,
}

impl<'a> Reviver<'a> {
    fn new(state: &'a Arc<ContainerState>, payload: &'a SnapshotPayload) -> Self {
        Self {
            state,
            payload,
            elements: HashMap::new(),
            values: Vec::new(),
            watches: HashMap::new(),
            flags: HashMap::new(),
        }
    }

    fn index_elements(&mut self) {
        let root = self.state.element();
        let mut next_id = 0;
        for el in std::iter::once(root.clone()).chain(root.descendants()) {
            let Some(id) = el.get_attribute("q:id") else {
                continue;
            };
            if let Ok(n) = decode_id(&id) {
                next_id = next_id.max(n as u64 + 1);
            }
            self.elements.insert(id, el);
        }
        self.state.reserve_element_ids(next_id);
    }

    fn element(&self, reference: &str) -> Option<Node> {
        let node = reference
            .strip_prefix(ELEMENT_PREFIX)
            .and_then(|id| self.elements.get(id))
            .cloned();
        if node.is_none() {
            tracing::warn!(reference, "payload references an unknown element");
        }
        node
    }

    fn index(&self, id: &str) -> Result<usize> {
        let index = decode_id(id)?;
        if index >= self.values.len() {
            return Err(Error::Payload(format!("object id `{id}` out of range")));
        }
        Ok(index)
    }

    fn shells(&mut self) -> Result<()> {
        let base = self.state.base_url();
        for obj in &self.payload.objs {
            let value = match obj {
                serde_json::Value::String(s) if s == UNDEFINED => Value::Undefined,
                serde_json::Value::String(s) if s == DOCUMENT => {
                    Value::Node(self.state.document().node().clone())
                }
                serde_json::Value::String(s) => match s.strip_prefix(QRL_PREFIX) {
                    Some(text) => {
                        let qrl = parse_qrl(text)?;
                        if let Some(base) = &base {
                            qrl.set_base(base);
                        }
                        Value::Qrl(qrl)
                    }
                    // Watches are recreated from the element that owns them.
                    None if s.starts_with(WATCH_PREFIX) => Value::Undefined,
                    None => Value::from(s.as_str()),
                },
                serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
                serde_json::Value::Bool(b) => Value::Bool(*b),
                serde_json::Value::Null => Value::Null,
                serde_json::Value::Object(_) => Value::Object(Target::object()),
                serde_json::Value::Array(_) => Value::Object(Target::array(Vec::new())),
            };
            self.values.push(value);
        }
        Ok(())
    }

    fn revive_watches(&mut self) -> Result<()> {
        for (id, meta) in &self.payload.ctx {
            let Some(list) = &meta.w else {
                continue;
            };
            let Some(host) = self.elements.get(id).cloned() else {
                continue;
            };
            for (position, token) in list.split_whitespace().enumerate() {
                let index = self.index(token)?;
                let text = self.payload.objs[index]
                    .as_str()
                    .and_then(|s| s.strip_prefix(WATCH_PREFIX))
                    .ok_or_else(|| Error::Payload(format!("`{token}` is not a watch")))?;
                let mut parts = text.split_whitespace();
                let (Some(flags), Some(_host), Some(qrl)) = (parts.next(), parts.next(), parts.next()) else {
                    return Err(Error::Payload(format!("malformed watch `{text}`")));
                };
                let flags = flags
                    .parse::<u8>()
                    .map_err(|_| Error::Payload(format!("malformed watch flags `{flags}`")))?;
                let mut flags = WatchFlags::from_bits_truncate(flags);
                flags.remove(WatchFlags::IS_CLEANUP);
                let qrl = self
                    .resolve(qrl)?
                    .as_qrl()
                    .cloned()
                    .ok_or_else(|| Error::Payload(format!("watch `{token}` has no QRL")))?;
                self.watches.insert(index, Watch::new(host.clone(), position, qrl, flags));
            }
        }
        Ok(())
    }

    fn seed_subscriptions(&mut self) -> Result<()> {
        for (index, subs) in self.payload.subs.iter().enumerate() {
            let Some(subs) = subs else {
                continue;
            };
            self.flags.insert(index, ProxyFlags::from_bits_truncate(subs.f));
            let Some(target) = self.values.get(index).and_then(Value::as_target).cloned() else {
                continue;
            };
            let mut entries = Vec::new();
            for entry in &subs.s {
                let mut parts = entry.split_whitespace();
                let Some(reference) = parts.next() else {
                    continue;
                };
                let subscriber = if reference.starts_with(ELEMENT_PREFIX) {
                    self.element(reference).map(Subscriber::Host)
                } else {
                    let watch = self.watches.get(&self.index(reference)?).cloned();
                    watch.map(Subscriber::Watch)
                };
                let Some(subscriber) = subscriber else {
                    continue;
                };
                let keys: SmallVec<_> = parts.map(Arc::from).collect();
                entries.push(SubEntry {
                    subscriber,
                    keys: (!keys.is_empty()).then_some(keys),
                });
            }
            self.state.subs.get_local(target.id(), Some(entries));
        }
        Ok(())
    }

    /// Live value of a reference.
    fn resolve(&self, reference: &str) -> Result<Value> {
        if reference == UNDEFINED {
            return Ok(Value::Undefined);
        }
        if reference == DOCUMENT {
            return Ok(Value::Node(self.state.document().node().clone()));
        }
        if reference.starts_with(ELEMENT_PREFIX) {
            return Ok(self.element(reference).map(Value::Node).unwrap_or_default());
        }
        if let Some(id) = reference.strip_suffix(MUTABLE_SUFFIX) {
            return Ok(Value::Mutable(Arc::new(self.resolve(id)?)));
        }
        if let Some(id) = reference.strip_suffix(STORE_SUFFIX) {
            let index = self.index(id)?;
            let value = &self.values[index];
            return Ok(match value.as_target() {
                Some(target) => {
                    let flags = self.flags.get(&index).copied().unwrap_or_default();
                    Value::Store(self.state.get_or_create_proxy(target, flags))
                }
                None => value.clone(),
            });
        }
        Ok(self.values[self.index(reference)?].clone())
    }

    fn nested(&self, value: &serde_json::Value) -> Result<Value> {
        Ok(match value {
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Null => Value::Null,
            serde_json::Value::String(reference) => self.resolve(reference)?,
            serde_json::Value::Object(_) | serde_json::Value::Array(_) => Value::Undefined,
        })
    }

    fn fill(&self) -> Result<()> {
        for (obj, value) in self.payload.objs.iter().zip(&self.values) {
            match (obj, value) {
                (serde_json::Value::Object(map), Value::Object(target)) => {
                    let mut data = IndexMap::with_capacity(map.len());
                    for (key, nested) in map {
                        data.insert(key.clone(), self.nested(nested)?);
                    }
                    target.replace(TargetData::Object(data));
                }
                (serde_json::Value::Array(items), Value::Object(target)) => {
                    let items = items.iter().map(|v| self.nested(v)).collect::<Result<_>>()?;
                    target.replace(TargetData::Array(items));
                }
                (_, Value::Qrl(qrl)) => {
                    let ids = qrl.capture_ids();
                    if !ids.is_empty() {
                        let captured = ids.iter().map(|id| self.resolve(id)).collect::<Result<_>>()?;
                        qrl.set_captured(captured);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn list(&self, list: Option<&String>) -> Result<Vec<Value>> {
        list.map(|l| l.split_whitespace().map(|r| self.resolve(r)).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn attach(&self, id: &str, meta: &SnapshotMeta) -> Result<()> {
        let Some(el) = self.elements.get(id) else {
            tracing::warn!(id, "payload describes an unknown element");
            return Ok(());
        };
        let ref_map = self.list(meta.r.as_ref())?;
        let seq = self.list(meta.s.as_ref())?;
        let mut watches = Vec::new();
        for token in meta.w.iter().flat_map(|w| w.split_whitespace()) {
            if let Some(watch) = self.watches.get(&self.index(token)?) {
                watches.push(watch.clone());
            }
        }
        let mut contexts = IndexMap::new();
        for pair in meta.c.iter().flat_map(|c| c.split_whitespace()) {
            if let Some((key, reference)) = pair.split_once('=') {
                contexts.insert(key.to_string(), self.resolve(reference)?);
            }
        }
        let (props, render) = match &meta.h {
            Some(h) => {
                let mut parts = h.split_whitespace();
                let props = parts.next().map(|r| self.resolve(r)).transpose()?;
                let render = parts.next().map(|r| self.resolve(r)).transpose()?;
                (
                    props.and_then(|v| v.as_store().cloned()),
                    render.and_then(|v| v.as_qrl().cloned()),
                )
            }
            None => (None, None),
        };

        let context = self.state.get_context(el);
        let mut context = context.lock();
        context.ref_map = ref_map;
        context.seq = seq;
        context.watches = watches;
        context.contexts = contexts;
        context.props = props;
        context.render_qrl = render;
        context.parent = el.parent().and_then(|p| p.closest(|n| n.has_attribute("q:host")));
        Ok(())
    }

    fn revive(mut self) -> Result<()> {
        self.index_elements();
        self.shells()?;
        self.revive_watches()?;
        self.seed_subscriptions()?;
        self.fill()?;
        for (id, meta) in &self.payload.ctx {
            self.attach(id, meta)?;
        }
        tracing::debug!(
            elements = self.payload.ctx.len(),
            objs = self.values.len(),
            "container resumed"
        );
        Ok(())
    }
}

fn find_script(element: &Node, script_type: &str) -> Option<Node> {
    element
        .children()
        .into_iter()
        .find(|n| n.is_tag("script") && n.get_attribute("type").as_deref() == Some(script_type))
}

/// Attach a container to `element` and revive the state paused into it.
///
/// Containers that are not paused, or whose payload is missing, are left
/// without state and a warning is logged.
pub(crate) fn resume_container(
    element: &Node,
    platform: Arc<dyn Platform>,
    config: RuntimeConfig,
) -> Result<Container> {
    if !element.is_element() {
        return Err(Error::NotAContainer);
    }
    let container = Container::new(element, platform, config);
    match element.get_attribute("q:container").as_deref() {
        Some("paused") => {}
        Some(status) => {
            tracing::warn!(status, "container is not paused, skipping resume");
            return Ok(container);
        }
        None => {
            tracing::warn!(?element, "element is not a container, skipping resume");
            return Ok(container);
        }
    }
    let state = container.state();
    let Some(script) = find_script(element, &state.config.payload_type) else {
        tracing::warn!("container has no state payload, skipping resume");
        return Ok(container);
    };
    let payload = SnapshotPayload::from_json(&script.text_content())?;
    Reviver::new(state, &payload).revive()?;

    element.set_attribute("q:container", "resumed");
    element.dispatch_event("resume");
    Ok(container)
}
