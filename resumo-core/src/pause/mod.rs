//! Pause and resume
//!
//! Pausing serializes everything a container needs to continue on another
//! machine into a JSON payload embedded in its DOM. Resuming revives that
//! state lazily: no component runs until an event or a store write asks
//! for it.
//!
//! # Format
//!
//! Every reachable object is stored once in `objs` and referenced by its
//! base-36 index. Nested numbers, booleans and `null` are written inline;
//! everything else is a reference string:
//!
//! | reference  | meaning                                  |
//! |------------|------------------------------------------|
//! | `7`        | object 7                                 |
//! | `7!`       | object 7, wrapped as a store             |
//! | `7%`       | object 7, wrapped as explicit-mutable    |
//! | `#4`       | the element whose `q:id` is `4`          |
//! | `\u{10}`   | undefined                                |
//! | `\u{12}`   | the document                             |
//!
//! QRLs and watches are strings in `objs`, prefixed with `\u{11}` and
//! `\u{13}` respectively.

pub mod payload;
mod serialize;
mod resume;

pub use payload::{decode_id, encode_id, SnapshotMeta, SnapshotPayload, SnapshotSubs};

pub(crate) use serialize::pause_container;
pub(crate) use resume::resume_container;
