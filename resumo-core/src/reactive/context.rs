//! Invocation Context
//!
//! The invocation context records "who is currently running": the container,
//! the document, the component host, the element and event being handled,
//! the lazy reference being invoked, and the subscriber that store reads
//! should be attributed to.
//!
//! # Implementation
//!
//! The context is a task-local value. [`invoke`] scopes it over a synchronous
//! call and [`invoke_async`] over a future; in the async case the value is
//! re-established on every poll, so it survives suspension points and never
//! leaks into unrelated tasks. Nested scopes shadow outer ones and restore
//! them on exit.
//!
//! Pending asynchronous work started inside a tracked call is registered with
//! [`InvokeContext::wait_on`]; the dispatcher that opened the scope awaits
//! all of it with [`InvokeContext::wait_all`].

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;

use crate::container::ContainerState;
use crate::dom::{Document, Node};
use crate::error::{Error, Result};
use crate::qrl::Qrl;
use crate::value::Value;

use super::store::Store;
use super::subscriber::Subscriber;

tokio::task_local! {
    static CURRENT: InvokeContext;
}

/// Pending work registered against an invocation.
pub type PendingWork = BoxFuture<'static, Result<()>>;

/// The fields of an invocation.
#[derive(Clone, Default)]
pub struct InvokeFrame {
    pub container: Option<Arc<ContainerState>>,
    pub document: Option<Document>,
    /// Component host the invocation belongs to.
    pub host: Option<Node>,
    /// Element currently executing (event target, or the host).
    pub element: Option<Node>,
    pub event: Option<Arc<str>>,
    /// Base URL for lazy references created during the call.
    pub url: Option<Arc<str>>,
    /// Reads are attributed to this subscriber.
    pub subscriber: Option<Subscriber>,
    /// Lazy reference being invoked; source of the lexical scope.
    pub qrl: Option<Qrl>,
    /// Props of the component being rendered.
    pub props: Option<Store>,
}

/// A tracked invocation.
#[derive(Clone)]
pub struct InvokeContext {
    frame: Arc<InvokeFrame>,
    seq: Arc<AtomicUsize>,
    waits: Arc<Mutex<Vec<PendingWork>>>,
}

impl InvokeContext {
    pub fn new(frame: InvokeFrame) -> Self {
        Self {
            frame: Arc::new(frame),
            seq: Arc::new(AtomicUsize::new(0)),
            waits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn frame(&self) -> &InvokeFrame {
        &self.frame
    }

    /// A fresh context naming `qrl`. Pending work and slot counters are
    /// shared with `self`.
    pub fn with_qrl(&self, qrl: Qrl) -> Self {
        let mut frame = (*self.frame).clone();
        frame.qrl = Some(qrl);
        Self {
            frame: Arc::new(frame),
            seq: self.seq.clone(),
            waits: self.waits.clone(),
        }
    }

    /// The innermost active context, if any.
    pub fn try_current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// The innermost active context, or `UseInvokeContext` naming `hook`.
    pub fn current(hook: &'static str) -> Result<Self> {
        Self::try_current().ok_or(Error::UseInvokeContext(hook))
    }

    /// Check if there is an active invocation.
    pub fn is_active() -> bool {
        CURRENT.try_with(|_| ()).is_ok()
    }

    /// Get the current subscriber, if any.
    pub fn current_subscriber() -> Option<Subscriber> {
        CURRENT
            .try_with(|ctx| ctx.frame.subscriber.clone())
            .ok()
            .flatten()
    }

    /// Claim the next sequential slot index.
    pub fn next_seq(&self) -> usize {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Register pending work the dispatcher must await.
    pub fn wait_on(&self, work: PendingWork) {
        self.waits.lock().push(work);
    }

    pub fn pending(&self) -> usize {
        self.waits.lock().len()
    }

    /// Await all pending work, including work registered while waiting.
    /// Every item runs to completion; the first failure is returned.
    pub async fn wait_all(&self) -> Result<()> {
        let mut first_err = None;
        loop {
            let pending = std::mem::take(&mut *self.waits.lock());
            if pending.is_empty() {
                break;
            }
            for result in join_all(pending).await {
                if let Err(err) = result {
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Run `f` with `ctx` as the current invocation.
pub fn invoke<R>(ctx: InvokeContext, f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(ctx, f)
}

/// Run `fut` with `ctx` as the current invocation on every poll.
pub fn invoke_async<F: Future>(ctx: InvokeContext, fut: F) -> impl Future<Output = F::Output> {
    CURRENT.scope(ctx, fut)
}

/// Values captured by the lazy reference currently being invoked.
pub fn use_lexical_scope() -> Result<Vec<Value>> {
    let ctx = InvokeContext::current("use_lexical_scope")?;
    let qrl = ctx
        .frame
        .qrl
        .as_ref()
        .ok_or(Error::UseInvokeContext("use_lexical_scope"))?;
    Ok(qrl.captured())
}

/// The component host of the current invocation.
pub fn use_host_element() -> Result<Node> {
    InvokeContext::current("use_host_element")?
        .frame
        .host
        .clone()
        .ok_or(Error::UseInvokeContext("use_host_element"))
}

pub fn use_document() -> Result<Document> {
    let ctx = InvokeContext::current("use_document")?;
    ctx.frame
        .document
        .clone()
        .or_else(|| ctx.frame.element.as_ref().and_then(Node::owner_document))
        .ok_or(Error::UseInvokeContext("use_document"))
}

/// Name of the event being handled.
pub fn use_event() -> Result<Arc<str>> {
    InvokeContext::current("use_event")?
        .frame
        .event
        .clone()
        .ok_or(Error::UseInvokeContext("use_event"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn host_ctx(doc: &Document) -> (Node, InvokeContext) {
        let host = doc.create_element("div");
        let ctx = InvokeContext::new(InvokeFrame {
            host: Some(host.clone()),
            subscriber: Some(Subscriber::Host(host.clone())),
            ..Default::default()
        });
        (host, ctx)
    }

    #[test]
    fn context_tracks_subscriber() {
        let doc = Document::new();
        let (host, ctx) = host_ctx(&doc);

        assert!(!InvokeContext::is_active());
        assert!(InvokeContext::current_subscriber().is_none());

        invoke(ctx, || {
            assert!(InvokeContext::is_active());
            assert_eq!(
                InvokeContext::current_subscriber(),
                Some(Subscriber::Host(host.clone()))
            );
        });

        // Context should be cleaned up after the scope
        assert!(!InvokeContext::is_active());
    }

    #[test]
    fn nested_contexts() {
        let doc = Document::new();
        let (outer_host, outer) = host_ctx(&doc);
        let (inner_host, inner) = host_ctx(&doc);

        invoke(outer, || {
            assert_eq!(use_host_element().unwrap(), outer_host);
            invoke(inner, || {
                assert_eq!(use_host_element().unwrap(), inner_host);
            });
            // After the inner scope, the outer one is current again
            assert_eq!(use_host_element().unwrap(), outer_host);
        });
    }

    #[test]
    fn hooks_fail_outside_invocation() {
        assert_eq!(
            use_host_element(),
            Err(Error::UseInvokeContext("use_host_element"))
        );
        assert!(use_lexical_scope().is_err());
    }

    #[test]
    fn sequential_slots_advance() {
        let ctx = InvokeContext::new(InvokeFrame::default());
        assert_eq!(ctx.next_seq(), 0);
        assert_eq!(ctx.with_qrl(Qrl::lazy("./a.js", "a")).next_seq(), 1);
        assert_eq!(ctx.next_seq(), 2);
    }

    #[tokio::test]
    async fn context_survives_suspension() {
        let doc = Document::new();
        let (host, ctx) = host_ctx(&doc);

        let seen = invoke_async(ctx, async {
            tokio::task::yield_now().await;
            use_host_element()
        })
        .await;
        assert_eq!(seen.unwrap(), host);
    }

    #[tokio::test]
    async fn wait_all_drains_nested_work() {
        let ctx = InvokeContext::new(InvokeFrame::default());
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_ctx = ctx.clone();
        let inner_counter = counter.clone();
        ctx.wait_on(
            async move {
                inner_counter.fetch_add(1, Ordering::SeqCst);
                let nested_counter = inner_counter.clone();
                inner_ctx.wait_on(
                    async move {
                        nested_counter.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Render("late".into()))
                    }
                    .boxed(),
                );
                Ok(())
            }
            .boxed(),
        );

        let result = ctx.wait_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(result, Err(Error::Render("late".into())));
        assert_eq!(ctx.pending(), 0);
    }
}
