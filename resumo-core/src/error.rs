//! Error Types
//!
//! Every failure the runtime can report is a variant of [`Error`]. Each
//! variant carries a stable numeric code so that logs and test assertions
//! can match on the kind of failure without depending on message text.
//!
//! # Categories
//!
//! - Contract violations (codes 1xx): programmer errors such as writing to an
//!   immutable props store or wrapping a value that is not a plain object.
//!   They are returned from the offending call and are not recoverable.
//! - Lazy reference failures (codes 2xx): malformed or unresolvable QRLs.
//! - Rendering and payload failures (codes 3xx): surfaced to the caller of
//!   the public entry point, or logged per host by the scheduler.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate error type.
///
/// The enum is `Clone` because memoized futures (shared module loads, the
/// shared render promise) hand the same outcome to every awaiting caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Attempted to wrap a primitive (or missing) value in a store.
    #[error("[RESUMO-100] only objects can be wrapped, got {0}")]
    OnlyObjectWrapped(String),

    /// Attempted to wrap an object that is not a plain object or array.
    #[error("[RESUMO-101] only object literals and arrays can be wrapped, got {0}")]
    OnlyLiteralWrapped(String),

    /// Attempted to write to an immutable (props) store.
    #[error("[RESUMO-102] props are immutable, cannot write `{0}`")]
    ImmutableProps(String),

    /// A value written into a store cannot be serialized.
    #[error("[RESUMO-103] value is not serializable: {0}")]
    VerifySerializable(String),

    /// A hook or ambient accessor was used outside a tracked invocation.
    #[error("[RESUMO-104] `{0}` must be called inside a tracked invocation")]
    UseInvokeContext(&'static str),

    /// The host marker was used somewhere other than the root of a render.
    #[error("[RESUMO-105] the <Host> marker may only appear at the root of a component")]
    HostNotRoot,

    /// A store was used after its container was dropped.
    #[error("[RESUMO-106] the container backing this store no longer exists")]
    ContainerGone,

    /// A write to an array store used neither an index nor a valid `length`.
    #[error("[RESUMO-107] invalid array write: {0}")]
    InvalidArrayWrite(String),

    /// A string could not be parsed as a lazy reference.
    #[error("[RESUMO-200] invalid QRL `{0}`")]
    InvalidQrl(String),

    /// A lazy reference could not be resolved.
    #[error("[RESUMO-201] failed to resolve `{symbol}` from `{chunk}`: {reason}")]
    QrlResolve {
        chunk: String,
        symbol: String,
        reason: String,
    },

    /// A resolved lazy reference is not callable.
    #[error("[RESUMO-202] `{0}` did not resolve to a function")]
    NotAFunction(String),

    /// An inlined lazy reference has no chunk to serialize.
    #[error("[RESUMO-203] QRL `{0}` has no chunk and the manifest does not know it")]
    QrlNotSerializable(String),

    /// A component's render function failed.
    #[error("[RESUMO-300] render failed: {0}")]
    Render(String),

    /// The element is not a container (missing `q:container`).
    #[error("[RESUMO-301] element is not a container")]
    NotAContainer,

    /// The serialized state payload could not be produced or decoded.
    #[error("[RESUMO-302] state payload error: {0}")]
    Payload(String),
}

impl Error {
    /// Stable numeric code for this error kind.
    pub fn code(&self) -> u16 {
        match self {
            Error::OnlyObjectWrapped(_) => 100,
            Error::OnlyLiteralWrapped(_) => 101,
            Error::ImmutableProps(_) => 102,
            Error::VerifySerializable(_) => 103,
            Error::UseInvokeContext(_) => 104,
            Error::HostNotRoot => 105,
            Error::ContainerGone => 106,
            Error::InvalidArrayWrite(_) => 107,
            Error::InvalidQrl(_) => 200,
            Error::QrlResolve { .. } => 201,
            Error::NotAFunction(_) => 202,
            Error::QrlNotSerializable(_) => 203,
            Error::Render(_) => 300,
            Error::NotAContainer => 301,
            Error::Payload(_) => 302,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Payload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = Error::ImmutableProps("count".into());
        assert_eq!(err.code(), 102);
        assert_eq!(
            err.to_string(),
            "[RESUMO-102] props are immutable, cannot write `count`"
        );
    }

    #[test]
    fn json_errors_become_payload_errors() {
        let err: Error = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert_eq!(err.code(), 302);
    }
}
