//! Reactive Primitives
//!
//! This module implements the fine-grained reactive core: stores, the
//! subscription manager, the invocation context and watches.
//!
//! # Concepts
//!
//! ## Stores
//!
//! A [`Store`] wraps a plain object or array. Reads performed while a
//! subscriber is running register that subscriber; writes notify exactly the
//! subscribers of the written key.
//!
//! ## Subscribers
//!
//! A [`Subscriber`] is either a component host (re-rendered through the
//! scheduler) or a [`Watch`] (a side effect re-run around the render pass).
//!
//! ## Invocation Context
//!
//! The [`InvokeContext`] names who is currently running. It is how a store
//! read knows which subscriber to record without any explicit parameter.
//!
//! # Implementation Notes
//!
//! Subscriptions live in a per-container [`SubscriptionManager`] keyed by
//! target id, with a reverse index per subscriber so that a re-render can
//! drop all of its previous subscriptions before re-establishing exactly
//! the ones its new output reads.

mod context;
mod store;
mod subscriber;
mod subscription;
mod watch;

pub use context::{
    invoke, invoke_async, use_document, use_event, use_host_element, use_lexical_scope,
    InvokeContext, InvokeFrame, PendingWork,
};
pub use store::{wrap, ProxyFlags, Store};
pub use subscriber::{Subscriber, SubscriberId};
pub use subscription::{KeySet, LocalSubscriptionManager, SubEntry, SubscriptionManager};
pub use watch::{Watch, WatchFlags, WatchId};

pub(crate) use watch::run_watch;
