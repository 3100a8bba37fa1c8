//! Watch Implementation
//!
//! A Watch is a side-effecting computation attached to a component host. It
//! re-runs whenever a store it read changes.
//!
//! # How Watches Work
//!
//! 1. A watch is registered during a component render and is marked dirty.
//!
//! 2. When it runs, its previous subscriptions and cleanup are dropped, then
//!    its body runs with the watch as the ambient subscriber, so every store
//!    read re-subscribes it.
//!
//! 3. If the body returns a function, that function becomes the cleanup. It
//!    runs before the next execution and when the watch is destroyed.
//!
//! # Kinds
//!
//! - `IS_WATCH` watches run before the DOM patch of a render pass.
//! - `IS_EFFECT` watches run after the commit, and only when their host was
//!   rendered in that pass.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::container::ContainerState;
use crate::dom::Node;
use crate::error::Result;
use crate::qrl::Qrl;
use crate::value::{Func, Value};

use super::context::{InvokeContext, InvokeFrame};
use super::subscriber::{Subscriber, SubscriberId};

bitflags! {
    /// Lifecycle flags of a watch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WatchFlags: u8 {
        /// Runs before the DOM patch.
        const IS_WATCH = 1 << 0;
        /// Needs to run.
        const IS_DIRTY = 1 << 1;
        /// Holds a cleanup that must run before destruction.
        const IS_CLEANUP = 1 << 2;
        /// Runs after the DOM commit.
        const IS_EFFECT = 1 << 3;
    }
}

/// Unique identifier for a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

impl WatchId {
    /// Generate a new unique watch ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WatchId {
    fn default() -> Self {
        Self::new()
    }
}

type Running = Shared<BoxFuture<'static, Result<()>>>;

struct WatchInner {
    id: WatchId,
    /// Declaration order within the host.
    index: usize,
    host: Node,
    qrl: Qrl,
    flags: Mutex<WatchFlags>,
    running: Mutex<Option<Running>>,
    cleanup: Mutex<Option<Func>>,
}

/// A side-effect record.
#[derive(Clone)]
pub struct Watch(Arc<WatchInner>);

impl Watch {
    pub fn new(host: Node, index: usize, qrl: Qrl, flags: WatchFlags) -> Self {
        Self(Arc::new(WatchInner {
            id: WatchId::new(),
            index,
            host,
            qrl,
            flags: Mutex::new(flags),
            running: Mutex::new(None),
            cleanup: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> WatchId {
        self.0.id
    }

    pub fn index(&self) -> usize {
        self.0.index
    }

    pub fn host(&self) -> &Node {
        &self.0.host
    }

    pub fn qrl(&self) -> &Qrl {
        &self.0.qrl
    }

    pub fn flags(&self) -> WatchFlags {
        *self.0.flags.lock()
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(WatchFlags::IS_DIRTY)
    }

    pub fn is_effect(&self) -> bool {
        self.flags().contains(WatchFlags::IS_EFFECT)
    }

    pub fn is_watch(&self) -> bool {
        self.flags().contains(WatchFlags::IS_WATCH)
    }

    /// Mark dirty. Returns `false` if it already was.
    pub(crate) fn mark_dirty(&self) -> bool {
        let mut flags = self.0.flags.lock();
        if flags.contains(WatchFlags::IS_DIRTY) {
            return false;
        }
        flags.insert(WatchFlags::IS_DIRTY);
        true
    }

    fn set_cleanup(&self, cleanup: Func) {
        *self.0.cleanup.lock() = Some(cleanup);
        self.0.flags.lock().insert(WatchFlags::IS_CLEANUP);
    }

    /// Run the pending cleanup, if any. Failures are logged.
    pub fn cleanup(&self) -> BoxFuture<'static, ()> {
        let cleanup = self.0.cleanup.lock().take();
        self.0.flags.lock().remove(WatchFlags::IS_CLEANUP);
        async move {
            if let Some(cleanup) = cleanup {
                if let Err(err) = cleanup.call(Vec::new()).await {
                    tracing::error!(error = %err, "watch cleanup failed");
                }
            }
        }
        .boxed()
    }

    /// Wait for an in-flight execution to settle.
    pub async fn settled(&self) {
        let running = self.0.running.lock().clone();
        if let Some(running) = running {
            let _ = running.await;
        }
    }

    /// Tear the watch down: drop its subscriptions and run its cleanup.
    pub(crate) async fn destroy(&self, state: &ContainerState) {
        self.settled().await;
        state.subs.clear_sub(SubscriberId::Watch(self.id()));
        self.cleanup().await;
    }

    pub fn ptr_eq(&self, other: &Watch) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Watch {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.0.id)
            .field("host", &self.0.host)
            .field("flags", &self.flags())
            .finish()
    }
}

/// Execute a watch body.
///
/// Old subscriptions and the previous cleanup are dropped first, then the
/// body runs with the watch as the ambient subscriber.
pub(crate) fn run_watch(watch: Watch, state: Arc<ContainerState>) -> BoxFuture<'static, Result<()>> {
    let run = {
        let watch = watch.clone();
        async move {
            state.subs.clear_sub(SubscriberId::Watch(watch.id()));
            watch.cleanup().await;
            watch.0.flags.lock().remove(WatchFlags::IS_DIRTY);

            let host = watch.host().clone();
            let ctx = InvokeContext::new(InvokeFrame {
                container: Some(state.clone()),
                document: host.owner_document(),
                host: Some(host.clone()),
                element: Some(host),
                event: Some(Arc::from("WatchEvent")),
                subscriber: Some(Subscriber::Watch(watch.clone())),
                ..Default::default()
            });
            let result = watch.qrl().invoke(ctx.clone(), Vec::new()).await;
            ctx.wait_all().await?;
            if let Value::Function(cleanup) = result? {
                watch.set_cleanup(cleanup);
            }
            Ok(())
        }
        .boxed()
        .shared()
    };

    *watch.0.running.lock() = Some(run.clone());
    async move {
        let result = run.await;
        *watch.0.running.lock() = None;
        result
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;

    fn watch(flags: WatchFlags) -> Watch {
        let host = Document::new().create_element("div");
        Watch::new(host, 0, Qrl::lazy("./w.js", "w"), flags)
    }

    #[test]
    fn watch_ids_are_unique() {
        let id1 = WatchId::new();
        let id2 = WatchId::new();
        let id3 = WatchId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn mark_dirty_is_edge_triggered() {
        let w = watch(WatchFlags::IS_WATCH);
        assert!(!w.is_dirty());
        assert!(w.mark_dirty());
        assert!(!w.mark_dirty());
        assert!(w.is_dirty());
        assert!(w.is_watch());
        assert!(!w.is_effect());
    }

    #[tokio::test]
    async fn cleanup_runs_once() {
        use std::sync::atomic::AtomicUsize;

        let w = watch(WatchFlags::IS_EFFECT);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        w.set_cleanup(Func::sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Undefined)
        }));
        assert!(w.flags().contains(WatchFlags::IS_CLEANUP));

        w.cleanup().await;
        w.cleanup().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!w.flags().contains(WatchFlags::IS_CLEANUP));
    }
}
