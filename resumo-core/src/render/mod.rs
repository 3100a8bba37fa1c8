//! Rendering
//!
//! This module turns declarative trees into DOM mutations.
//!
//! # Pipeline
//!
//! ```text
//! store write ──► notify_render(host) ──► scheduler (batch) ──► render pass
//!                                                                   │
//!                 ┌─────────────────────────────────────────────────┘
//!                 ▼
//!   render_component ──► visitor (diff) ──► DomOp log ──► commit (raf)
//! ```
//!
//! - [`jsx`]: the declarative tree a render function returns.
//! - [`ops`]: the render context and the deferred operation log.
//! - [`visitor`]: the keyed reconciler.
//! - [`scheduler`]: batching of dirty hosts and watches into passes.
//! - [`element`]: per-element runtime state and the component hooks.

pub mod element;
pub mod jsx;
pub(crate) mod ops;
pub(crate) mod scheduler;
pub(crate) mod visitor;

pub use element::{
    use_client_effect, use_context, use_context_provider, use_sequential_scope, use_store,
    use_store_with, use_watch, ElementContext, SequentialScope, SharedElementContext,
};
pub use jsx::{comment, h, host, skip, slot, text, JsxKind, JsxNode};
pub use ops::DomOp;
