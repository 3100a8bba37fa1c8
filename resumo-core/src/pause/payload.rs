//! Payload wire types.
//!
//! ```text
//! {
//!   "ctx":  { "<q:id>": { "r": "..", "h": "..", "w": "..", "s": "..", "c": ".." } },
//!   "objs": [ <value>, ... ],
//!   "subs": [ null | { "f": <flags>, "s": ["<subscriber> [key ...]", ...] }, ... ]
//! }
//! ```
//!
//! Object ids are base-36 indexes into `objs`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reference to `undefined`, or to anything that could not be serialized.
pub const UNDEFINED: &str = "\u{10}";
/// Prefix of a serialized QRL in `objs`.
pub const QRL_PREFIX: &str = "\u{11}";
/// Reference to the owning document.
pub const DOCUMENT: &str = "\u{12}";
/// Prefix of a serialized watch in `objs`.
pub const WATCH_PREFIX: &str = "\u{13}";
/// Prefix of an element reference.
pub const ELEMENT_PREFIX: char = '#';
/// Suffix: revive as a wrapped store.
pub const STORE_SUFFIX: char = '!';
/// Suffix: revive as an explicit-mutable value.
pub const MUTABLE_SUFFIX: char = '%';

/// The serialized state of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub ctx: IndexMap<String, SnapshotMeta>,
    pub objs: Vec<serde_json::Value>,
    pub subs: Vec<Option<SnapshotSubs>>,
}

/// Element metadata. Every field is a space-separated list of references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Reference map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<String>,
    /// Props and render QRL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<String>,
    /// Watches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<String>,
    /// Sequential slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    /// Provided contexts as `key=ref` pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
}

/// Proxy metadata of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSubs {
    /// Proxy flag bits.
    pub f: u8,
    /// One `"<subscriber-ref> [key ...]"` entry per subscriber.
    pub s: Vec<String>,
}

impl SnapshotPayload {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// JSON safe to embed in a `<script>` element.
    pub fn to_script_text(&self) -> Result<String> {
        Ok(self.to_json()?.replace('<', "\\u003c"))
    }

    /// The object an id refers to, ignoring reference suffixes.
    pub fn obj(&self, reference: &str) -> Option<&serde_json::Value> {
        let id = reference.trim_end_matches(&[STORE_SUFFIX, MUTABLE_SUFFIX][..]);
        decode_id(id).ok().and_then(|index| self.objs.get(index))
    }
}

/// Base-36 encoding of an index.
pub fn encode_id(mut n: usize) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[n % 36]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

pub fn decode_id(id: &str) -> Result<usize> {
    usize::from_str_radix(id, 36).map_err(|_| Error::Payload(format!("invalid id `{id}`")))
}
