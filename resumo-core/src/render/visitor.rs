//! Reconciler
//!
//! Compares a declarative tree against the DOM and records the minimal set
//! of [`DomOp`](super::DomOp)s that make them match.
//!
//! # Child Lists
//!
//! Children are diffed with the classic two-pointer walk from both ends of
//! the old and new lists, testing in order:
//!
//! 1. same node at the start,
//! 2. same node at the end,
//! 3. old start moved to the end,
//! 4. old end moved to the start.
//!
//! On a miss a `q:key → old index` map is built (once) and consulted. A keyed
//! match with the same tag is patched and moved; anything else is created.
//! Leftover new nodes are inserted, leftover old nodes removed, except under
//! `<head>` where foreign nodes are expected.
//!
//! # Props
//!
//! Props are diffed against a per-element cache. `class`, `style`, `value`,
//! `checked` and `dangerouslySetInnerHTML` have dedicated handlers; listener
//! props register QRLs on the element context and mirror them into an
//! `on:<event>` attribute; everything else becomes a property when the
//! element has one by that name, otherwise an attribute.
//!
//! # Components and Slots
//!
//! A component host keeps its props in an immutable store. When a render
//! changes those props the component is rendered right away, before its
//! projected children are placed into the `q:slot` holes of its output.
//! Children whose slot does not exist are parked in a hidden `q:template`.

use std::collections::HashMap;

use futures_util::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;

use crate::dom::Node;
use crate::error::{Error, Result};
use crate::qrl::{stringify_qrl, Qrl};
use crate::reactive::ProxyFlags;
use crate::value::{Target, TargetData, Value};

use super::jsx::{JsxKind, JsxNode, RENDER_PROP, SLOT_PROP, SLOT_TAG, TEMPLATE_TAG};
use super::ops::RenderContext;
use super::scheduler::render_component;

type Visit<'a, T = ()> = BoxFuture<'a, Result<T>>;

const KEY_ATTR: &str = "q:key";
const HOST_PREFIX: &str = "host:";

/// Reconcile the children of `parent` against `new`.
///
/// `component_output` is set when `parent` is a component host being
/// rendered; its `q:template` child is then left alone.
pub(crate) fn visit_children<'a>(
    rctx: &'a mut RenderContext,
    parent: &'a Node,
    new: Vec<JsxNode>,
    component_output: bool,
) -> Visit<'a> {
    async move {
        if new.iter().any(|n| n.kind() == &JsxKind::Host) {
            return Err(Error::HostNotRoot);
        }
        let old: Vec<Node> = rctx
            .children(parent)
            .into_iter()
            .filter(|n| !(component_output && n.is_tag(TEMPLATE_TAG)))
            .collect();
        if matches!(new.as_slice(), [only] if only.kind() == &JsxKind::Skip) && !old.is_empty() {
            return Ok(());
        }
        let new: Vec<JsxNode> = new
            .into_iter()
            .filter(|n| !matches!(n.kind(), JsxKind::Skip | JsxKind::Empty))
            .collect();

        let mut old: Vec<Option<Node>> = old.into_iter().map(Some).collect();
        let mut placed: Vec<Option<Node>> = vec![None; new.len()];
        let (mut old_start, mut old_end) = (0, old.len());
        let (mut new_start, mut new_end) = (0, new.len());
        let mut keyed: Option<HashMap<String, usize>> = None;

        while old_start < old_end && new_start < new_end {
            let Some(start) = old[old_start].clone() else {
                old_start += 1;
                continue;
            };
            let Some(end) = old[old_end - 1].clone() else {
                old_end -= 1;
                continue;
            };

            if is_same(&start, &new[new_start]) {
                patch(rctx, &start, &new[new_start]).await?;
                placed[new_start] = Some(start);
                old_start += 1;
                new_start += 1;
            } else if is_same(&end, &new[new_end - 1]) {
                patch(rctx, &end, &new[new_end - 1]).await?;
                placed[new_end - 1] = Some(end);
                old_end -= 1;
                new_end -= 1;
            } else if is_same(&start, &new[new_end - 1]) {
                // Moved right
                patch(rctx, &start, &new[new_end - 1]).await?;
                let reference = rctx.next_sibling(parent, &end);
                rctx.insert_before(parent, &start, reference.as_ref());
                placed[new_end - 1] = Some(start);
                old_start += 1;
                new_end -= 1;
            } else if is_same(&end, &new[new_start]) {
                // Moved left
                patch(rctx, &end, &new[new_start]).await?;
                rctx.insert_before(parent, &end, Some(&start));
                placed[new_start] = Some(end);
                old_end -= 1;
                new_start += 1;
            } else {
                let matched = {
                    let keyed = keyed.get_or_insert_with(|| key_index(&old[..old_end], old_start));
                    new[new_start]
                        .key_str()
                        .and_then(|key| keyed.get(key).copied())
                        .filter(|&index| {
                            index >= old_start && index < old_end && old[index].is_some()
                        })
                };
                let jsx = &new[new_start];
                let node = match matched.and_then(|index| old[index].clone().map(|n| (index, n))) {
                    Some((index, candidate)) if candidate.tag() == jsx.tag() => {
                        patch(rctx, &candidate, jsx).await?;
                        old[index] = None;
                        rctx.insert_before(parent, &candidate, Some(&start));
                        candidate
                    }
                    _ => {
                        let created = create(rctx, jsx).await?;
                        rctx.insert_before(parent, &created, Some(&start));
                        created
                    }
                };
                placed[new_start] = Some(node);
                new_start += 1;
            }
        }

        if new_start < new_end {
            let reference = placed.get(new_end).cloned().flatten();
            for index in new_start..new_end {
                let created = create(rctx, &new[index]).await?;
                rctx.insert_before(parent, &created, reference.as_ref());
                placed[index] = Some(created);
            }
        }

        if old_start < old_end && !parent.is_tag("head") {
            for node in old[old_start..old_end].iter().flatten() {
                rctx.remove(parent, node);
            }
        }
        Ok(())
    }
    .boxed()
}

fn node_key(node: &Node) -> Option<String> {
    node.get_attribute(KEY_ATTR)
}

fn key_index(old: &[Option<Node>], from: usize) -> HashMap<String, usize> {
    old.iter()
        .enumerate()
        .skip(from)
        .filter_map(|(index, node)| Some((node_key(node.as_ref()?)?, index)))
        .collect()
}

/// Same kind, same tag and same key.
fn is_same(node: &Node, jsx: &JsxNode) -> bool {
    match jsx.kind() {
        JsxKind::Text(_) => node.is_text(),
        JsxKind::Comment(_) => node.is_comment(),
        JsxKind::Element(tag) => {
            node.tag() == Some(tag.as_ref()) && node_key(node).as_deref() == jsx.key_str()
        }
        _ => false,
    }
}

fn patch<'a>(rctx: &'a mut RenderContext, node: &'a Node, jsx: &'a JsxNode) -> Visit<'a> {
    async move {
        match jsx.kind() {
            JsxKind::Text(data) | JsxKind::Comment(data) => {
                let current = match rctx.cached(node, "data") {
                    Some(value) => value.to_display_string(),
                    None => node.data(),
                };
                if current != data.as_ref() {
                    rctx.set_property(node, "data", Value::from(data.as_ref()));
                    rctx.set_cached(node, "data", Value::from(data.as_ref()));
                }
                Ok(())
            }
            JsxKind::Element(_) => visit_element(rctx, node, jsx).await,
            _ => Ok(()),
        }
    }
    .boxed()
}

fn create<'a>(rctx: &'a mut RenderContext, jsx: &'a JsxNode) -> Visit<'a, Node> {
    async move {
        match jsx.kind() {
            JsxKind::Text(data) => Ok(rctx.create_text(data)),
            JsxKind::Comment(data) => Ok(rctx.create_comment(data)),
            JsxKind::Element(tag) => {
                let el = rctx.create_element(tag);
                if let Some(key) = jsx.key_str() {
                    rctx.set_attribute(&el, KEY_ATTR, Some(key.to_string()));
                }
                visit_element(rctx, &el, jsx).await?;
                Ok(el)
            }
            JsxKind::Host => Err(Error::HostNotRoot),
            JsxKind::Skip | JsxKind::Empty => Err(Error::Render("cannot create an empty node".into())),
        }
    }
    .boxed()
}

fn visit_element<'a>(rctx: &'a mut RenderContext, el: &'a Node, jsx: &'a JsxNode) -> Visit<'a> {
    async move {
        if jsx.is_component() {
            return visit_component(rctx, el, jsx).await;
        }
        update_props(rctx, el, jsx.props().iter())?;
        if el.is_tag(SLOT_TAG) {
            // Projected content is owned by the enclosing host's parent.
            if let Some(host) = rctx.current_host().cloned() {
                let host_id = ensure_element_id(rctx, &host);
                apply_attribute(rctx, el, "q:sref", Some(host_id));
            }
            return Ok(());
        }
        if jsx.props().contains_key("dangerouslySetInnerHTML") {
            return Ok(());
        }
        visit_children(rctx, el, jsx.child_nodes().to_vec(), false).await
    }
    .boxed()
}

fn visit_component<'a>(rctx: &'a mut RenderContext, host: &'a Node, jsx: &'a JsxNode) -> Visit<'a> {
    async move {
        let state = rctx.state.clone();
        let mut host_props = IndexMap::new();
        let mut props = IndexMap::new();
        for (key, value) in jsx.props() {
            if key == RENDER_PROP {
                continue;
            }
            if let Some(name) = key.strip_prefix(HOST_PREFIX) {
                host_props.insert(name.to_string(), value.clone());
            } else if key == SLOT_PROP {
                host_props.insert(key.clone(), value.clone());
            } else {
                props.insert(key.clone(), value.clone());
            }
        }
        apply_attribute(rctx, host, "q:host", Some(String::new()));
        update_props(rctx, host, host_props.iter())?;

        let context = state.get_context(host);
        let (existing, mut dirty) = {
            let mut ctx = context.lock();
            ctx.parent = rctx.current_host().cloned();
            let render = jsx.render_qrl().cloned();
            let replaced = match (&ctx.render_qrl, &render) {
                (Some(old), Some(new)) => !old.is_same(new),
                _ => true,
            };
            if replaced {
                ctx.render_qrl = render;
            }
            (ctx.props.clone(), replaced)
        };
        match existing {
            Some(store) => {
                for (key, value) in &props {
                    dirty |= store.write_prop(key, value.clone());
                }
                for key in store.target().keys() {
                    if !props.contains_key(&key) {
                        dirty |= store.write_prop(&key, Value::Undefined);
                    }
                }
            }
            None => {
                let target = Target::from_entries(props);
                let store = state.get_or_create_proxy(&target, ProxyFlags::IMMUTABLE);
                context.lock().props = Some(store);
                dirty = true;
            }
        }
        let dirty = {
            let mut ctx = context.lock();
            ctx.dirty |= dirty;
            ctx.dirty
        };
        if dirty && !rctx.visited.contains(host) {
            if let Err(err) = render_component(rctx, host).await {
                tracing::error!(?host, error = %err, "component render failed");
            }
        }
        project_slots(rctx, host, jsx.child_nodes()).await
    }
    .boxed()
}

/// Place `children` of component `host` into the slot holes of its output.
fn project_slots<'a>(rctx: &'a mut RenderContext, host: &'a Node, children: &'a [JsxNode]) -> Visit<'a> {
    async move {
        let mut groups: IndexMap<String, Vec<JsxNode>> = IndexMap::new();
        for child in children {
            groups
                .entry(child.slot_name().to_string())
                .or_default()
                .push(child.clone());
        }
        let host_id = ensure_element_id(rctx, host);
        let slots = find_slots(rctx, host, &host_id);
        let template = rctx
            .children(host)
            .into_iter()
            .find(|n| n.is_tag(TEMPLATE_TAG));

        for (name, slot) in slots {
            let group = groups.shift_remove(&name).unwrap_or_default();
            visit_children(rctx, &slot, group, false).await?;
        }

        let parked: Vec<JsxNode> = groups.into_values().flatten().collect();
        match template {
            Some(template) if parked.is_empty() => rctx.remove(host, &template),
            Some(template) => visit_children(rctx, &template, parked, false).await?,
            None if parked.is_empty() => {}
            None => {
                let template = rctx.create_element(TEMPLATE_TAG);
                rctx.set_attribute(&template, "hidden", Some(String::new()));
                visit_children(rctx, &template, parked, false).await?;
                rctx.append_child(host, &template);
            }
        }
        Ok(())
    }
    .boxed()
}

/// Slot holes of `host`, by name. Nested hosts and templates are not
/// searched.
fn find_slots(rctx: &RenderContext, host: &Node, host_id: &str) -> IndexMap<String, Node> {
    let mut slots = IndexMap::new();
    let mut stack: Vec<Node> = rctx.children(host).into_iter().rev().collect();
    while let Some(node) = stack.pop() {
        if node.is_tag(TEMPLATE_TAG) || node.has_attribute("q:host") {
            continue;
        }
        if node.is_tag(SLOT_TAG) {
            let owner = rctx
                .cached(&node, "q:sref")
                .map(|v| v.to_display_string())
                .or_else(|| node.get_attribute("q:sref"));
            if owner.as_deref() == Some(host_id) {
                let name = node.get_attribute("name").unwrap_or_default();
                slots.entry(name).or_insert(node);
            }
            continue;
        }
        stack.extend(rctx.children(&node).into_iter().rev());
    }
    slots
}

/// The `q:id` of `node`, assigning one when missing.
pub(crate) fn ensure_element_id(rctx: &mut RenderContext, node: &Node) -> String {
    if let Some(id) = node.get_attribute("q:id") {
        return id;
    }
    if let Some(Value::String(id)) = rctx.cached(node, "q:id") {
        return id.to_string();
    }
    let id = rctx.state.next_element_id();
    rctx.set_attribute(node, "q:id", Some(id.clone()));
    rctx.set_cached(node, "q:id", Value::from(id.as_str()));
    id
}

// ----------------------------------------------------------------------
// Props
// ----------------------------------------------------------------------

/// Apply `props` to `el`.
pub(crate) fn update_props<'p>(
    rctx: &mut RenderContext,
    el: &Node,
    props: impl Iterator<Item = (&'p String, &'p Value)>,
) -> Result<()> {
    let mut listeners: IndexMap<String, Vec<Qrl>> = IndexMap::new();
    for (key, value) in props {
        if let Some(event) = listener_key(key) {
            match value {
                Value::Qrl(qrl) => listeners.entry(event).or_default().push(qrl.clone()),
                other => tracing::warn!(key, kind = other.type_name(), "listener is not a QRL"),
            }
            continue;
        }
        match key.as_str() {
            RENDER_PROP | "children" | "key" | KEY_ATTR => {}
            "class" | "className" => apply_class(rctx, el, &class_list(value)),
            "style" => apply_attribute(rctx, el, "style", style_string(value)),
            "dangerouslySetInnerHTML" => apply_property(rctx, el, "innerHTML", value),
            key if el.has_property_key(key) => apply_property(rctx, el, key, value),
            key => apply_attribute(rctx, el, key, attr_repr(value)),
        }
    }
    if listeners.is_empty() {
        return Ok(());
    }

    let platform = rctx.state.platform();
    let context = rctx.state.get_context(el);
    let attributes: Vec<(String, String)> = {
        let mut ctx = context.lock();
        for (key, qrls) in listeners {
            for qrl in qrls {
                ctx.add_listener(&key, qrl);
            }
        }
        let listeners = ctx.listeners.clone();
        listeners
            .iter()
            .map(|(key, qrls)| {
                let value = qrls
                    .iter()
                    .filter_map(|q| {
                        // Captures index the element's reference map, as in a paused tree.
                        let ids: Vec<String> =
                            q.captured().iter().map(|v| ctx.add_ref(v).to_string()).collect();
                        stringify_qrl(q, Some(platform.as_ref()), &ids).ok()
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                (key.clone(), value)
            })
            .collect()
    };
    for (key, value) in attributes {
        if !value.is_empty() {
            apply_attribute(rctx, el, &key, Some(value));
        }
    }
    Ok(())
}

/// Normalized listener attribute for a prop key, if it is one.
///
/// `on:click`, `on-window:resize` and `on-document:keydown` are used as is;
/// `onClick$`, `onWindowResize$` and `onDocumentKeydown$` are converted.
fn listener_key(key: &str) -> Option<String> {
    if key.starts_with("on:") || key.starts_with("on-window:") || key.starts_with("on-document:") {
        return Some(key.to_string());
    }
    let name = key.strip_prefix("on")?.strip_suffix('$')?;
    let (scope, name) = if let Some(rest) = name.strip_prefix("Window") {
        ("on-window", rest)
    } else if let Some(rest) = name.strip_prefix("Document") {
        ("on-document", rest)
    } else {
        ("on", name)
    };
    if name.is_empty() {
        return None;
    }
    Some(format!("{scope}:{}", name.to_ascii_lowercase()))
}

fn attr_repr(value: &Value) -> Option<String> {
    match value {
        Value::Undefined | Value::Null | Value::Bool(false) => None,
        Value::Bool(true) => Some(String::new()),
        Value::Mutable(inner) => attr_repr(inner),
        other => Some(other.to_display_string()),
    }
}

fn class_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s.split_whitespace().map(str::to_string).collect(),
        Value::Mutable(inner) => class_list(inner),
        Value::Object(_) | Value::Store(_) => match value.as_target().map(Target::data) {
            Some(TargetData::Array(items)) => items.iter().flat_map(class_list).collect(),
            Some(TargetData::Object(map)) => map
                .into_iter()
                .filter(|(_, v)| v.truthy())
                .map(|(k, _)| k)
                .collect(),
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn style_string(value: &Value) -> Option<String> {
    match value.as_target().map(Target::data) {
        Some(TargetData::Object(map)) => {
            let rules: Vec<String> = map
                .iter()
                .filter(|(_, v)| !v.is_nullish())
                .map(|(k, v)| format!("{}: {}", kebab_case(k), v.to_display_string()))
                .collect();
            Some(rules.join("; "))
        }
        _ => attr_repr(value),
    }
}

fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            out.push('-');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn current_attribute(rctx: &RenderContext, el: &Node, name: &str) -> Option<String> {
    match rctx.cached(el, name) {
        Some(Value::String(s)) => Some(s.to_string()),
        Some(_) => None,
        None => el.get_attribute(name),
    }
}

fn apply_attribute(rctx: &mut RenderContext, el: &Node, name: &str, repr: Option<String>) {
    if current_attribute(rctx, el, name) != repr {
        rctx.set_attribute(el, name, repr.clone());
    }
    rctx.set_cached(el, name, Value::from(repr));
}

fn apply_class(rctx: &mut RenderContext, el: &Node, classes: &[String]) {
    let current: Vec<String> = current_attribute(rctx, el, "class")
        .map(|c| c.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    if current == classes {
        return;
    }
    let joined = classes.join(" ");
    if current.iter().all(|c| classes.contains(c)) {
        let added: Vec<String> = classes
            .iter()
            .filter(|c| !current.contains(c))
            .cloned()
            .collect();
        if added.is_empty() {
            return;
        }
        rctx.class_list_add(el, added);
    } else {
        rctx.set_attribute(el, "class", Some(joined.clone()));
    }
    rctx.set_cached(el, "class", Value::from(joined));
}

fn apply_property(rctx: &mut RenderContext, el: &Node, name: &str, value: &Value) {
    let current = rctx
        .cached(el, name)
        .or_else(|| el.property(name))
        .unwrap_or_default();
    if !current.same(value) {
        rctx.set_property(el, name, value.clone());
    }
    rctx.set_cached(el, name, value.clone());
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::container::Container;
    use crate::dom::Document;
    use crate::platform::ModulePlatform;
    use crate::render::jsx::{h, text};
    use crate::render::DomOp;

    fn setup() -> (Container, Node) {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let root = doc.create_element("div");
        body.append_child(&root);
        let container = Container::new(&root, Arc::new(ModulePlatform::new()), Default::default());
        (container, root)
    }

    async fn reconcile(container: &Container, parent: &Node, tree: Vec<JsxNode>) -> Vec<DomOp> {
        let mut rctx = RenderContext::new(container.state().clone());
        visit_children(&mut rctx, parent, tree, false).await.unwrap();
        rctx.commit().await
    }

    fn list(keys: &[&str]) -> Vec<JsxNode> {
        keys.iter().map(|k| h("li").key(k).child(*k)).collect()
    }

    fn labels(parent: &Node) -> Vec<String> {
        parent.children().iter().map(Node::text_content).collect()
    }

    #[tokio::test]
    async fn keyed_rotation_only_moves() {
        let (container, root) = setup();
        reconcile(&container, &root, list(&["a", "b", "c"])).await;
        let before = root.children();

        let ops = reconcile(&container, &root, list(&["c", "a", "b"])).await;

        assert!(!ops.is_empty());
        assert!(ops.iter().all(|op| op.name() == "insert-before"));
        assert_eq!(labels(&root), vec!["c", "a", "b"]);
        let after = root.children();
        assert_eq!(after[0], before[2]);
        assert_eq!(after[1], before[0]);
    }

    #[tokio::test]
    async fn keyed_reorders_reuse_nodes() {
        let (container, root) = setup();
        reconcile(&container, &root, list(&["a", "b", "c", "d", "e"])).await;
        let original = root.children();

        let ops = reconcile(&container, &root, list(&["e", "c", "x", "a"])).await;

        assert_eq!(labels(&root), vec!["e", "c", "x", "a"]);
        let after = root.children();
        assert_eq!(after[0], original[4]);
        assert_eq!(after[1], original[2]);
        assert_eq!(after[3], original[0]);
        let removes = ops.iter().filter(|op| op.name() == "remove").count();
        assert_eq!(removes, 2);
    }

    #[tokio::test]
    async fn unchanged_tree_produces_no_ops() {
        let (container, root) = setup();
        let tree = || vec![h("p").prop("class", "a b").prop("title", "t").child("x")];
        reconcile(&container, &root, tree()).await;
        let ops = reconcile(&container, &root, tree()).await;
        assert!(ops.is_empty(), "{ops:?}");
    }

    #[tokio::test]
    async fn text_changes_patch_data() {
        let (container, root) = setup();
        reconcile(&container, &root, vec![h("span").child(text(0))]).await;
        let ops = reconcile(&container, &root, vec![h("span").child(text(1))]).await;

        assert_eq!(ops.len(), 1);
        match &ops[0] {
            DomOp::SetProperty { name, value, .. } => {
                assert_eq!(name, "data");
                assert_eq!(value.as_str(), Some("1"));
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(root.text_content(), "1");
    }

    #[tokio::test]
    async fn class_additions_use_classlist() {
        let (container, root) = setup();
        reconcile(&container, &root, vec![h("p").prop("class", "a")]).await;

        let classes = Value::object([("a", Value::from(true)), ("b", Value::from(true))]);
        let ops = reconcile(&container, &root, vec![h("p").prop("class", classes)]).await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].name(), "classlist-add");

        let ops = reconcile(&container, &root, vec![h("p").prop("class", "b")]).await;
        assert_eq!(ops[0].name(), "set-attribute");
        assert_eq!(root.first_child().unwrap().get_attribute("class").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn style_objects_render_as_declarations() {
        let (container, root) = setup();
        let style = Value::object([("fontSize", Value::from("12px")), ("color", Value::from("red"))]);
        reconcile(&container, &root, vec![h("p").prop("style", style)]).await;
        assert_eq!(
            root.first_child().unwrap().get_attribute("style").as_deref(),
            Some("font-size: 12px; color: red")
        );
    }

    #[tokio::test]
    async fn head_keeps_foreign_children() {
        let (container, _) = setup();
        let head = container.document().head().unwrap();
        head.append_child(&container.document().create_element("meta"));
        reconcile(&container, &head, vec![h("title").child("t")]).await;
        assert_eq!(head.children().len(), 2);
    }

    #[tokio::test]
    async fn host_marker_outside_root_is_rejected() {
        let (container, root) = setup();
        let mut rctx = RenderContext::new(container.state().clone());
        let err = visit_children(&mut rctx, &root, vec![h("div").child(crate::render::host())], false)
            .await
            .unwrap_err();
        assert_eq!(err, Error::HostNotRoot);
    }

    #[tokio::test]
    async fn listeners_are_serialized_into_attributes() {
        let (container, root) = setup();
        let qrl = Qrl::lazy("./app.js", "onClick");
        reconcile(&container, &root, vec![h("button").prop("onClick$", qrl.clone())]).await;

        let button = root.first_child().unwrap();
        assert_eq!(button.get_attribute("on:click").as_deref(), Some("./app.js#onClick"));
        let context = container.state().try_context(&button).unwrap();
        assert_eq!(context.lock().listeners()["on:click"].len(), 1);

        let ops = reconcile(&container, &root, vec![h("button").on("click", qrl)]).await;
        assert!(ops.is_empty());
    }

    #[tokio::test]
    async fn listener_captures_index_the_ref_map() {
        let (container, root) = setup();
        let state = Value::object([("count", Value::from(0))]);
        let qrl = Qrl::lazy("./app.js", "onClick");
        let tree = || vec![h("button").on("click", qrl.with_capture(vec![state.clone()]))];

        reconcile(&container, &root, tree()).await;
        let button = root.first_child().unwrap();
        assert_eq!(button.get_attribute("on:click").as_deref(), Some("./app.js#onClick[0]"));
        let context = container.state().try_context(&button).unwrap();
        assert_eq!(context.lock().ref_map.len(), 1);

        let ops = reconcile(&container, &root, tree()).await;
        assert!(ops.is_empty(), "{ops:?}");
        assert_eq!(context.lock().ref_map.len(), 1);
    }

    #[tokio::test]
    async fn revived_listener_attributes_are_kept() {
        let (container, root) = setup();
        let state = Value::object([("count", Value::from(0))]);
        let button = container.document().create_element("button");
        button.set_attribute("on:click", "./app.js#onClick[0]");
        root.append_child(&button);
        container.state().get_context(&button).lock().ref_map.push(state.clone());

        let qrl = Qrl::lazy("./app.js", "onClick").with_capture(vec![state]);
        let ops = reconcile(&container, &root, vec![h("button").on("click", qrl)]).await;

        assert!(ops.iter().all(|op| op.name() != "set-attribute"), "{ops:?}");
        assert_eq!(button.get_attribute("on:click").as_deref(), Some("./app.js#onClick[0]"));
    }

    #[test]
    fn listener_keys_normalize() {
        assert_eq!(listener_key("onClick$").as_deref(), Some("on:click"));
        assert_eq!(listener_key("onWindowResize$").as_deref(), Some("on-window:resize"));
        assert_eq!(listener_key("on-document:keydown").as_deref(), Some("on-document:keydown"));
        assert_eq!(listener_key("onclick"), None);
        assert_eq!(listener_key("title"), None);
    }
}
