//! Render Scheduler
//!
//! The scheduler batches "this component is dirty" and "this watch is
//! dirty" signals into render passes.
//!
//! # States
//!
//! - **Idle**: nothing pending, no render promise.
//! - **Scheduled**: a pass is queued on the next tick. Every caller that
//!   marks something dirty before it starts shares the same promise.
//! - **Rendering**: the dirty hosts were frozen into `rendering`. Marks that
//!   arrive now are staged for the following pass.
//!
//! # A Pass
//!
//! 1. Freeze `next` into `rendering`.
//! 2. Drain dirty pre-render watches in document order, repeating while
//!    they dirty more watches.
//! 3. Merge hosts staged during step 2 into `rendering`.
//! 4. Render every dirty host not already rendered by an ancestor.
//! 5. Commit the operation log inside the paint-aligned callback.
//! 6. Run dirty effects, plus staged effects whose host was rendered.
//! 7. Reschedule when anything new is pending.

use std::cmp::Ordering;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use indexmap::{IndexMap, IndexSet};
use tracing::Instrument;

use crate::container::ContainerState;
use crate::dom::Node;
use crate::error::{Error, Result};
use crate::reactive::{
    run_watch, InvokeContext, InvokeFrame, Subscriber, SubscriberId, Watch, WatchId,
};
use crate::value::Value;

use super::jsx::{JsxKind, JsxNode};
use super::ops::RenderContext;
use super::visitor::{update_props, visit_children};

pub(crate) type RenderPromise = Shared<BoxFuture<'static, ()>>;

/// Pending work of a container.
#[derive(Default)]
pub(crate) struct SchedState {
    pub(crate) hosts_next: IndexSet<Node>,
    pub(crate) hosts_staging: IndexSet<Node>,
    /// Frozen host set of the pass in flight.
    pub(crate) hosts_rendering: Option<IndexSet<Node>>,
    pub(crate) watch_next: WatchSet,
    pub(crate) watch_staging: WatchSet,
    pub(crate) render_promise: Option<RenderPromise>,
}

impl SchedState {
    fn is_rendering(&self) -> bool {
        self.hosts_rendering.is_some()
    }

    fn has_pending(&self) -> bool {
        !self.hosts_next.is_empty() || !self.watch_next.is_empty()
    }
}

impl ContainerState {
    /// Mark the component hosted by `host` dirty.
    pub(crate) fn notify_render(self: &Arc<Self>, host: &Node) {
        if !self.platform().can_rerender() {
            tracing::warn!(?host, "cannot re-render on a static platform");
            return;
        }
        {
            let context = self.get_context(host);
            let mut context = context.lock();
            if context.dirty {
                return;
            }
            context.dirty = true;
        }
        let schedule = {
            let mut sched = self.sched.lock();
            if sched.is_rendering() {
                sched.hosts_staging.insert(host.clone());
                false
            } else {
                sched.hosts_next.insert(host.clone());
                true
            }
        };
        if schedule {
            self.schedule_frame();
        }
    }

    /// Queue a dirty watch.
    pub(crate) fn notify_watch(self: &Arc<Self>, watch: &Watch) {
        if watch.is_effect() && self.platform().is_server() {
            return;
        }
        let schedule = {
            let mut sched = self.sched.lock();
            if sched.is_rendering() {
                sched.watch_staging.insert(watch.id(), watch.clone());
                false
            } else {
                sched.watch_next.insert(watch.id(), watch.clone());
                true
            }
        };
        if schedule {
            self.schedule_frame();
        }
    }

    /// Drop a subscriber from every pending set.
    pub(crate) fn unschedule(&self, subscriber: &Subscriber) {
        let mut sched = self.sched.lock();
        match subscriber {
            Subscriber::Host(host) => {
                sched.hosts_next.shift_remove(host);
                sched.hosts_staging.shift_remove(host);
            }
            Subscriber::Watch(watch) => {
                sched.watch_next.shift_remove(&watch.id());
                sched.watch_staging.shift_remove(&watch.id());
            }
        }
    }

    /// Return the pending pass, scheduling one when there is none.
    pub(crate) fn schedule_frame(self: &Arc<Self>) -> RenderPromise {
        let mut sched = self.sched.lock();
        if let Some(promise) = &sched.render_promise {
            return promise.clone();
        }
        let state = self.clone();
        let promise = async move {
            state.platform().next_tick().await;
            let pass = state.passes() + 1;
            render_marked(state)
                .instrument(tracing::debug_span!("render_pass", pass))
                .await;
        }
        .boxed()
        .shared();
        sched.render_promise = Some(promise.clone());
        drop(sched);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(promise.clone());
        }
        promise
    }

    /// Await the render promise until the container is idle.
    pub(crate) async fn flush(&self) {
        loop {
            let promise = self.sched.lock().render_promise.clone();
            match promise {
                Some(promise) => promise.await,
                None => break,
            }
        }
    }
}

fn by_document_order(a: &Watch, b: &Watch) -> Ordering {
    a.host()
        .document_order(b.host())
        .then(a.index().cmp(&b.index()))
}

async fn run_watches(state: &Arc<ContainerState>, mut watches: Vec<Watch>) {
    watches.sort_by(by_document_order);
    for watch in watches {
        if let Err(err) = run_watch(watch.clone(), state.clone()).await {
            tracing::error!(?watch, error = %err, "watch failed");
        }
    }
}

type WatchSet = IndexMap<WatchId, Watch>;

/// Split pre-render watches off `set`.
fn take_watches(set: &mut WatchSet) -> (WatchSet, WatchSet) {
    std::mem::take(set)
        .into_iter()
        .partition(|(_, watch)| watch.is_watch())
}

/// Run dirty pre-render watches until none are left, including the ones
/// they dirty while running.
async fn execute_watches_before(state: &Arc<ContainerState>) {
    loop {
        let watches: Vec<Watch> = {
            let mut sched = state.sched.lock();
            let (next, next_rest) = take_watches(&mut sched.watch_next);
            let (staged, staged_rest) = take_watches(&mut sched.watch_staging);
            sched.watch_next = next_rest;
            sched.watch_staging = staged_rest;
            next.into_values().chain(staged.into_values()).collect()
        };
        if watches.is_empty() {
            break;
        }
        run_watches(state, watches).await;
    }
}

/// Run dirty effects after the commit. Staged effects only run when their
/// host was rendered in this pass.
async fn execute_watches_after(state: &Arc<ContainerState>, rendered: &IndexSet<Node>) {
    let effects: Vec<Watch> = {
        let mut sched = state.sched.lock();
        let mut effects = Vec::new();
        let next = std::mem::take(&mut sched.watch_next);
        for (id, watch) in next {
            if watch.is_effect() {
                effects.push(watch);
            } else {
                sched.watch_next.insert(id, watch);
            }
        }
        let staging = std::mem::take(&mut sched.watch_staging);
        for (id, watch) in staging {
            if watch.is_effect() && rendered.contains(watch.host()) {
                effects.push(watch);
            } else {
                sched.watch_staging.insert(id, watch);
            }
        }
        effects
    };
    run_watches(state, effects).await;
}

/// One render pass over the frozen dirty-host set.
async fn render_marked(state: Arc<ContainerState>) {
    {
        let mut sched = state.sched.lock();
        let next = std::mem::take(&mut sched.hosts_next);
        sched.hosts_rendering = Some(next);
    }

    execute_watches_before(&state).await;

    let mut hosts: Vec<Node> = {
        let mut sched = state.sched.lock();
        let staged = std::mem::take(&mut sched.hosts_staging);
        let rendering = sched.hosts_rendering.get_or_insert_with(IndexSet::new);
        rendering.extend(staged);
        rendering.iter().cloned().collect()
    };
    hosts.sort_by(|a, b| a.document_order(b));
    tracing::debug!(hosts = hosts.len(), "render pass started");

    let mut rctx = RenderContext::new(state.clone());
    for host in hosts {
        if rctx.visited.contains(&host) || !state.is_dirty(&host) {
            continue;
        }
        if let Err(err) = render_component(&mut rctx, &host).await {
            tracing::error!(?host, error = %err, "component render failed");
        }
    }

    finish_pass(&state, rctx).await;
}

/// Commit, run effects and reschedule.
async fn finish_pass(state: &Arc<ContainerState>, mut rctx: RenderContext) {
    let ops = rctx.commit().await;
    tracing::debug!(ops = ops.len(), rendered = rctx.visited.len(), "render pass committed");
    state.record_pass(ops);

    execute_watches_after(state, &rctx.visited).await;

    let pending = {
        let mut sched = state.sched.lock();
        let staged_hosts = std::mem::take(&mut sched.hosts_staging);
        sched.hosts_next.extend(staged_hosts);
        let staged_watches = std::mem::take(&mut sched.watch_staging);
        sched.watch_next.extend(staged_watches);
        sched.hosts_rendering = None;
        sched.render_promise = None;
        sched.has_pending()
    };
    if pending {
        state.schedule_frame();
    }
}

/// Render the tree into `parent` as a pass of its own.
///
/// The pass is installed as the render promise, so `flush` and `pause`
/// wait for it like for any scheduled pass.
pub(crate) async fn render_root(state: Arc<ContainerState>, parent: Node, tree: JsxNode) -> Result<()> {
    let pass = root_pass(state.clone(), parent, tree);
    loop {
        state.flush().await;
        let installed = {
            let mut sched = state.sched.lock();
            if sched.render_promise.is_none() {
                sched.hosts_rendering = Some(IndexSet::new());
                sched.render_promise = Some(pass.clone().map(|_| ()).boxed().shared());
                true
            } else {
                false
            }
        };
        if installed {
            break;
        }
    }
    pass.await
}

fn root_pass(state: Arc<ContainerState>, parent: Node, tree: JsxNode) -> Shared<BoxFuture<'static, Result<()>>> {
    async move {
        let pass = state.passes() + 1;
        let mut rctx = RenderContext::new(state.clone());
        let result = visit_children(&mut rctx, &parent, vec![tree], false)
            .instrument(tracing::debug_span!("render_root", pass))
            .await;
        finish_pass(&state, rctx).await;
        result
    }
    .boxed()
    .shared()
}

/// Render one component into its host.
///
/// The host's previous subscriptions are dropped first; the render function
/// re-establishes exactly the ones its output reads. When the render itself
/// dirties the host again, its output is discarded before being diffed and
/// the component renders again.
pub(crate) fn render_component<'a>(
    rctx: &'a mut RenderContext,
    host: &'a Node,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let state = rctx.state.clone();
        let context = state.get_context(host);
        loop {
            let (render, props) = {
                let mut context = context.lock();
                context.dirty = false;
                (context.render_qrl.clone(), context.props.clone())
            };
            let Some(render) = render else {
                return Err(Error::Render(format!("{host:?} is not a component")));
            };
            state.subs.clear_sub(SubscriberId::Host(host.id()));

            let ctx = InvokeContext::new(InvokeFrame {
                container: Some(state.clone()),
                document: Some(rctx.doc.clone()),
                host: Some(host.clone()),
                element: Some(host.clone()),
                event: Some(Arc::from("qRender")),
                url: state.base_url().map(Arc::from),
                subscriber: Some(Subscriber::Host(host.clone())),
                props: props.clone(),
                ..Default::default()
            });
            let props = props.map(Value::Store).unwrap_or_default();
            let output = render.invoke(ctx.clone(), vec![props]).await;
            let waited = ctx.wait_all().await;
            let output = output?;
            waited?;

            if context.lock().dirty {
                tracing::debug!(?host, "state changed during render, restarting");
                state.sched.lock().hosts_staging.shift_remove(host);
                continue;
            }
            rctx.visited.insert(host.clone());
            state.sched.lock().hosts_staging.shift_remove(host);

            let root = JsxNode::from(output);
            let children = match root.kind() {
                JsxKind::Host => {
                    update_props(rctx, host, root.props().iter())?;
                    root.child_nodes().to_vec()
                }
                JsxKind::Empty => Vec::new(),
                _ => vec![root],
            };
            rctx.hosts.push(host.clone());
            let result = visit_children(rctx, host, children, true).await;
            rctx.hosts.pop();
            return result;
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::dom::Document;
    use crate::platform::ModulePlatform;
    use crate::qrl::Qrl;
    use crate::reactive::WatchFlags;
    use crate::render::jsx::{h, text};
    use crate::value::Func;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn container() -> Container {
        let doc = Document::new();
        let body = doc.body().unwrap();
        Container::new(&body, Arc::new(ModulePlatform::new()), Default::default())
    }

    #[tokio::test]
    async fn dirty_marks_share_one_promise() {
        let container = container();
        let state = container.state();
        let a = container.document().create_element("div");
        let b = container.document().create_element("div");

        state.notify_render(&a);
        let first = state.sched.lock().render_promise.clone().unwrap();
        state.notify_render(&b);
        state.notify_render(&a);
        let second = state.sched.lock().render_promise.clone().unwrap();

        assert_eq!(state.sched.lock().hosts_next.len(), 2);
        assert!(first.ptr_eq(&second));
    }

    #[tokio::test]
    async fn root_renders_hold_the_render_promise() {
        let container = container();
        let state = container.state().clone();
        let body = container.document().body().unwrap();
        let gate = Arc::new(tokio::sync::Notify::new());
        let render = {
            let gate = gate.clone();
            Qrl::with_resolver(
                "./slow.js",
                "Slow_render",
                Arc::new(move || {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok::<_, Error>(Value::from(Func::sync(|_| Ok(h("p").child("done").into()))))
                    }
                    .boxed()
                }),
            )
        };

        let task = {
            let state = state.clone();
            let body = body.clone();
            tokio::spawn(async move {
                render_root(state, body, JsxNode::component("div", render)).await
            })
        };
        while state.sched.lock().render_promise.is_none() {
            tokio::task::yield_now().await;
        }
        assert!(state.sched.lock().is_rendering());

        gate.notify_one();
        container.flush().await;
        assert_eq!(body.text_content(), "done");
        assert!(state.sched.lock().render_promise.is_none());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn hosts_rendered_after_staging_are_not_rendered_again() {
        let container = container();
        let body = container.document().body().unwrap();
        let store = container
            .create_store(
                Value::object([("trigger", Value::from(0)), ("n", Value::from(0))]),
                Default::default(),
            )
            .unwrap();
        let child_renders = Arc::new(AtomicUsize::new(0));
        let child = {
            let store = store.clone();
            let renders = child_renders.clone();
            Qrl::new(
                "./child.js",
                "Child_render",
                Func::sync(move |_| {
                    renders.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(h("b").child(text(store.get("n"))).into())
                }),
            )
        };
        // The parent writes what the child reads, marking the child mid-pass.
        let parent = {
            let store = store.clone();
            Qrl::new(
                "./parent.js",
                "Parent_render",
                Func::sync(move |_| {
                    store.set("n", store.get("trigger"))?;
                    Ok(JsxNode::component("span", child.clone()).into())
                }),
            )
        };
        container.render(&body, JsxNode::component("div", parent)).await.unwrap();
        assert_eq!(child_renders.load(AtomicOrdering::SeqCst), 1);
        let passes = container.render_passes();

        store.set("trigger", 1).unwrap();
        container.flush().await;

        assert_eq!(body.text_content(), "1");
        assert_eq!(child_renders.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(container.render_passes(), passes + 1);
        assert!(container.state().sched.lock().hosts_staging.is_empty());
    }

    #[test]
    fn marks_during_a_pass_are_staged() {
        let container = container();
        let state = container.state();
        let host = container.document().create_element("div");
        state.sched.lock().hosts_rendering = Some(IndexSet::new());

        state.notify_render(&host);

        let sched = state.sched.lock();
        assert!(sched.hosts_next.is_empty());
        assert!(sched.hosts_staging.contains(&host));
        assert!(sched.render_promise.is_none());
    }

    #[test]
    fn static_platforms_never_schedule() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let container = Container::new(&body, Arc::new(ModulePlatform::static_snapshot()), Default::default());
        container.state().notify_render(&body);
        assert!(container.state().sched.lock().hosts_next.is_empty());
    }

    #[test]
    fn effects_are_skipped_on_servers() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        let container = Container::new(&body, Arc::new(ModulePlatform::server()), Default::default());
        let watch = Watch::new(body, 0, Qrl::lazy("./e.js", "e"), WatchFlags::IS_EFFECT);
        container.state().notify_watch(&watch);
        assert!(container.state().sched.lock().watch_next.is_empty());
    }

    #[test]
    fn unschedule_clears_pending_sets() {
        let container = container();
        let state = container.state();
        let host = container.document().create_element("div");
        state.sched.lock().hosts_rendering = Some(IndexSet::new());
        state.notify_render(&host);
        state.unschedule(&Subscriber::Host(host));
        assert!(state.sched.lock().hosts_staging.is_empty());
    }
}
