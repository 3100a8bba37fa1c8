//! Lazy References (QRL)
//!
//! A QRL is a serializable pointer to code: the module chunk that exports
//! it, the exported symbol name, and the values its closure captured.
//!
//! # Resolution
//!
//! 1. A QRL that already holds its value returns it immediately.
//! 2. A QRL with a direct resolver (statically known code) calls it once and
//!    caches the result.
//! 3. Otherwise the platform loads `symbol` from `chunk`, resolved against
//!    the container base URL. The platform caches loads by final URL, and
//!    the QRL caches the settled value on itself.
//!
//! # Wire Format
//!
//! `chunk[#symbol][id id ...]`. The symbol segment is omitted when it is
//! `default`; the capture segment is present only when something was
//! captured. Before serialization captures are live values; after parsing
//! they are ids into the state graph until the resumer revives them.

use std::fmt;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::reactive::{invoke_async, InvokeContext};
use crate::value::{FuncFuture, Value};

/// Direct resolver for statically known code.
pub type Resolver = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
enum Capture {
    None,
    /// Ids into the state graph, not yet revived.
    Ids(Vec<String>),
    Values(Arc<Vec<Value>>),
}

struct QrlInner {
    chunk: Arc<str>,
    symbol: Arc<str>,
    resolver: Option<Resolver>,
    resolved: Arc<Mutex<Option<Value>>>,
    capture: RwLock<Capture>,
    base: RwLock<Option<Arc<str>>>,
}

/// A lazy reference to a function and its captured scope.
#[derive(Clone)]
pub struct Qrl(Arc<QrlInner>);

impl Qrl {
    fn build(chunk: &str, symbol: &str, resolver: Option<Resolver>, resolved: Option<Value>) -> Self {
        Self(Arc::new(QrlInner {
            chunk: Arc::from(chunk),
            symbol: Arc::from(symbol),
            resolver,
            resolved: Arc::new(Mutex::new(resolved)),
            capture: RwLock::new(Capture::None),
            base: RwLock::new(None),
        }))
    }

    /// A QRL whose value is already known.
    pub fn new(chunk: &str, symbol: &str, value: impl Into<Value>) -> Self {
        Self::build(chunk, symbol, None, Some(value.into()))
    }

    /// A QRL resolved through the platform on first use.
    pub fn lazy(chunk: &str, symbol: &str) -> Self {
        Self::build(chunk, symbol, None, None)
    }

    /// A QRL for code bundled with the caller. The chunk is looked up in
    /// the manifest when the QRL is serialized.
    pub fn inlined(symbol: &str, value: impl Into<Value>) -> Self {
        Self::build("", symbol, None, Some(value.into()))
    }

    pub fn with_resolver(chunk: &str, symbol: &str, resolver: Resolver) -> Self {
        Self::build(chunk, symbol, Some(resolver), None)
    }

    /// A copy of this QRL closing over `values`. The resolved value cache is
    /// shared with `self`.
    pub fn with_capture(&self, values: Vec<Value>) -> Self {
        Self(Arc::new(QrlInner {
            chunk: self.0.chunk.clone(),
            symbol: self.0.symbol.clone(),
            resolver: self.0.resolver.clone(),
            resolved: self.0.resolved.clone(),
            capture: RwLock::new(Capture::Values(Arc::new(values))),
            base: RwLock::new(self.0.base.read().clone()),
        }))
    }

    pub fn chunk(&self) -> &str {
        &self.0.chunk
    }

    pub fn symbol(&self) -> &str {
        &self.0.symbol
    }

    /// Live captured values. Empty until revived when parsed from a string.
    pub fn captured(&self) -> Vec<Value> {
        match &*self.0.capture.read() {
            Capture::Values(values) => values.as_ref().clone(),
            _ => Vec::new(),
        }
    }

    /// Captured ids awaiting revival.
    pub fn capture_ids(&self) -> Vec<String> {
        match &*self.0.capture.read() {
            Capture::Ids(ids) => ids.clone(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn set_captured(&self, values: Vec<Value>) {
        *self.0.capture.write() = Capture::Values(Arc::new(values));
    }

    pub fn base(&self) -> Option<Arc<str>> {
        self.0.base.read().clone()
    }

    pub fn set_base(&self, base: &str) {
        *self.0.base.write() = Some(Arc::from(base));
    }

    /// The cached value, if resolution already happened.
    pub fn resolved(&self) -> Option<Value> {
        self.0.resolved.lock().clone()
    }

    /// Same chunk and symbol: the same code.
    pub fn is_same(&self, other: &Qrl) -> bool {
        self.0.chunk == other.0.chunk && self.0.symbol == other.0.symbol
    }

    pub fn ptr_eq(&self, other: &Qrl) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Identity of this handle, for identity-keyed tables.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Resolve to the referenced value.
    pub fn resolve(&self, platform: Option<Arc<dyn Platform>>) -> BoxFuture<'static, Result<Value>> {
        if let Some(value) = self.resolved() {
            return future::ready(Ok(value)).boxed();
        }
        let cache = self.0.resolved.clone();
        let load = if let Some(resolver) = &self.0.resolver {
            resolver()
        } else if let Some(platform) = platform {
            let base = self.base();
            platform.import_symbol(base.as_deref(), &self.0.chunk, &self.0.symbol)
        } else {
            let err = Error::QrlResolve {
                chunk: self.0.chunk.to_string(),
                symbol: self.0.symbol.to_string(),
                reason: "no platform to load from".into(),
            };
            return future::ready(Err(err)).boxed();
        };
        async move {
            let value = load.await?;
            let mut cache = cache.lock();
            Ok(cache.get_or_insert(value).clone())
        }
        .boxed()
    }

    /// Resolve and call the referenced function.
    ///
    /// The call runs under a context derived from `ctx` that names this QRL,
    /// so the callee can reach its captured values with
    /// [`use_lexical_scope`](crate::reactive::use_lexical_scope).
    pub fn invoke(&self, ctx: InvokeContext, args: Vec<Value>) -> FuncFuture {
        let ctx = ctx.with_qrl(self.clone());
        let state = ctx.frame().container.clone();
        if self.base().is_none() {
            if let Some(base) = state.as_ref().and_then(|s| s.base_url()) {
                self.set_base(&base);
            }
        }
        let resolve = self.resolve(state.map(|s| s.platform()));
        let symbol = self.0.symbol.clone();
        invoke_async(ctx, async move {
            let value = resolve.await?;
            let func = value
                .as_func()
                .cloned()
                .ok_or_else(|| Error::NotAFunction(symbol.to_string()))?;
            func.call(args).await
        })
        .boxed()
    }
}

impl fmt::Debug for Qrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Qrl({}#{})", self.0.chunk, self.0.symbol)
    }
}

/// Parse `chunk[#symbol][id id ...]`.
pub fn parse_qrl(s: &str) -> Result<Qrl> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidQrl(s.to_string()));
    }
    let (head, ids) = match s.find('[') {
        Some(open) => {
            let rest = &s[open + 1..];
            let close = rest
                .find(']')
                .ok_or_else(|| Error::InvalidQrl(s.to_string()))?;
            let ids = rest[..close].split_whitespace().map(str::to_string).collect();
            (&s[..open], ids)
        }
        None => (s, Vec::new()),
    };
    let (chunk, symbol) = match head.split_once('#') {
        Some((chunk, symbol)) if !symbol.is_empty() => (chunk, symbol),
        Some((chunk, _)) => (chunk, "default"),
        None => (head, "default"),
    };
    if chunk.is_empty() {
        return Err(Error::InvalidQrl(s.to_string()));
    }
    let qrl = Qrl::lazy(chunk, symbol);
    if !ids.is_empty() {
        *qrl.0.capture.write() = Capture::Ids(ids);
    }
    Ok(qrl)
}

/// Render a QRL in wire format, with `capture_ids` as the capture segment.
///
/// Inlined QRLs look their chunk up through `platform`; a QRL with no known
/// chunk cannot be serialized.
pub fn stringify_qrl(qrl: &Qrl, platform: Option<&dyn Platform>, capture_ids: &[String]) -> Result<String> {
    let chunk = if qrl.chunk().is_empty() {
        platform
            .and_then(|p| p.chunk_for_symbol(qrl.symbol()))
            .ok_or_else(|| Error::QrlNotSerializable(qrl.symbol().to_string()))?
    } else {
        qrl.chunk().to_string()
    };
    let mut out = chunk;
    if qrl.symbol() != "default" {
        out.push('#');
        out.push_str(qrl.symbol());
    }
    if !capture_ids.is_empty() {
        out.push('[');
        out.push_str(&capture_ids.join(" "));
        out.push(']');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ModulePlatform;
    use crate::reactive::{use_lexical_scope, InvokeFrame};
    use crate::value::Func;

    #[test]
    fn parse_full_form() {
        let qrl = parse_qrl("./chunk-a.js#onClick[0 1a]").unwrap();
        assert_eq!(qrl.chunk(), "./chunk-a.js");
        assert_eq!(qrl.symbol(), "onClick");
        assert_eq!(qrl.capture_ids(), vec!["0", "1a"]);
    }

    #[test]
    fn parse_defaults_symbol() {
        let qrl = parse_qrl("./chunk-a.js").unwrap();
        assert_eq!(qrl.symbol(), "default");
        assert!(qrl.capture_ids().is_empty());
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(matches!(parse_qrl(""), Err(Error::InvalidQrl(_))));
        assert!(matches!(parse_qrl("./a.js#x[0 1"), Err(Error::InvalidQrl(_))));
        assert!(matches!(parse_qrl("#x"), Err(Error::InvalidQrl(_))));
    }

    #[test]
    fn stringify_omits_default_symbol_and_empty_capture() {
        let qrl = Qrl::lazy("./a.js", "default");
        assert_eq!(stringify_qrl(&qrl, None, &[]).unwrap(), "./a.js");

        let qrl = Qrl::lazy("./a.js", "handler");
        let ids = vec!["2".to_string(), "b".to_string()];
        assert_eq!(stringify_qrl(&qrl, None, &ids).unwrap(), "./a.js#handler[2 b]");
    }

    #[test]
    fn stringify_inlined_uses_manifest() {
        let platform = ModulePlatform::new();
        let qrl = Qrl::inlined("s_render", Value::Undefined);
        assert!(matches!(
            stringify_qrl(&qrl, Some(&platform), &[]),
            Err(Error::QrlNotSerializable(_))
        ));

        platform.register_manifest("s_render", "./q-render.js");
        assert_eq!(
            stringify_qrl(&qrl, Some(&platform), &[]).unwrap(),
            "./q-render.js#s_render"
        );
    }

    #[test]
    fn same_listener_ignores_captures() {
        let a = Qrl::lazy("./a.js", "h");
        let b = a.with_capture(vec![Value::from(1)]);
        assert!(a.is_same(&b));
        assert!(!a.ptr_eq(&b));
        assert!(!a.is_same(&Qrl::lazy("./a.js", "g")));
    }

    #[tokio::test]
    async fn resolution_is_cached_and_loads_once() {
        let platform = Arc::new(ModulePlatform::new());
        let func = Func::sync(|_| Ok(Value::from(7)));
        platform.register("./a.js", "h", func.clone());
        let qrl = Qrl::lazy("./a.js", "h");

        let dyn_platform: Arc<dyn Platform> = platform.clone();
        let first = qrl.resolve(Some(dyn_platform.clone())).await.unwrap();
        let second = qrl.resolve(Some(dyn_platform.clone())).await.unwrap();
        let third = parse_qrl("./a.js#h").unwrap().resolve(Some(dyn_platform)).await.unwrap();

        assert!(first.same(&second));
        assert!(first.same(&third));
        assert!(first.as_func().unwrap().ptr_eq(&func));
        assert_eq!(platform.load_count(), 1);
    }

    #[tokio::test]
    async fn resolver_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let qrl = Qrl::with_resolver(
            "./a.js",
            "h",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Ok(Value::from("resolved"))).boxed()
            }),
        );
        qrl.resolve(None).await.unwrap();
        qrl.resolve(None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invoke_exposes_captured_scope() {
        let body = Func::sync(|args| {
            let scope = use_lexical_scope()?;
            let base = scope[0].as_f64().unwrap_or_default();
            let arg = args.first().and_then(Value::as_f64).unwrap_or_default();
            Ok(Value::from(base + arg))
        });
        let qrl = Qrl::new("./a.js", "add", body).with_capture(vec![Value::from(40)]);

        let ctx = InvokeContext::new(InvokeFrame::default());
        let result = qrl.invoke(ctx, vec![Value::from(2)]).await.unwrap();
        assert_eq!(result.as_f64(), Some(42.0));
    }

    #[tokio::test]
    async fn invoke_rejects_non_functions() {
        let qrl = Qrl::new("./a.js", "value", Value::from(1));
        let ctx = InvokeContext::new(InvokeFrame::default());
        assert_eq!(
            qrl.invoke(ctx, Vec::new()).await.unwrap_err(),
            Error::NotAFunction("value".into())
        );
    }
}
