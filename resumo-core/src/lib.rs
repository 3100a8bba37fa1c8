//! Resumo Core
//!
//! This crate provides the core runtime for the Resumo resumable UI framework.
//! It implements:
//!
//! - Fine-grained reactive stores with per-key subscriptions
//! - Lazy, serializable references to code (QRLs)
//! - A batching render scheduler and keyed DOM reconciler
//! - Pausing a container into a JSON payload and resuming it elsewhere
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: stores, subscriptions, the invocation context and watches
//! - `qrl`: lazy code references and their string form
//! - `render`: declarative trees, the reconciler and the scheduler
//! - `pause`: the pause/resume payload
//! - `container`: the handle tying all of the above to one DOM subtree
//! - `dom` and `platform`: the host environment the runtime drives
//!
//! # Example
//!
//! ```rust,ignore
//! use resumo_core::{h, text, Container, ModulePlatform, Qrl, Value};
//!
//! let container = Container::new(&root, Arc::new(ModulePlatform::new()), Default::default());
//! let store = container.create_store(Value::object([("count", 0.into())]), Default::default())?;
//!
//! container.render(&root, h("button").child(text("0"))).await?;
//! store.set("count", 1)?;
//! container.flush().await;
//! ```

pub mod config;
pub mod container;
pub mod dom;
pub mod error;
pub mod pause;
pub mod platform;
pub mod qrl;
pub mod reactive;
pub mod render;
pub mod value;

pub use config::RuntimeConfig;
pub use container::{Container, ContainerState, GlobalScope, StoreOptions};
pub use dom::{Document, Node};
pub use error::{Error, Result};
pub use pause::SnapshotPayload;
pub use platform::{ModulePlatform, Platform};
pub use qrl::{parse_qrl, stringify_qrl, Qrl};
pub use reactive::{
    use_document, use_event, use_host_element, use_lexical_scope, InvokeContext, Store,
};
pub use render::{
    comment, h, host, skip, slot, text, use_client_effect, use_context, use_context_provider,
    use_sequential_scope, use_store, use_store_with, use_watch, DomOp, JsxNode,
};
pub use value::{mutable, Func, Value};
