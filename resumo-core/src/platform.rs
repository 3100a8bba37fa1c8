//! Platform Abstraction
//!
//! Everything the runtime needs from its host environment goes through the
//! [`Platform`] trait: loading a symbol from a module chunk, the two
//! scheduling primitives (next tick and the paint-aligned callback), the
//! symbol → chunk manifest, and whether we run on a server.
//!
//! [`ModulePlatform`] is a tokio-backed implementation whose "modules" are
//! registered in memory. It caches every load by final URL, so resolving the
//! same chunk and symbol twice performs a single load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::value::Value;

/// Capabilities supplied by the host environment.
pub trait Platform: Send + Sync {
    /// Load `symbol` from `chunk`, resolved against `base`.
    fn import_symbol(&self, base: Option<&str>, chunk: &str, symbol: &str)
        -> BoxFuture<'static, Result<Value>>;

    /// Yield until the next turn of the event loop.
    fn next_tick(&self) -> BoxFuture<'static, ()>;

    /// Yield until the next paint-aligned callback.
    fn raf(&self) -> BoxFuture<'static, ()>;

    /// Chunk exporting `symbol`, from the bundler manifest.
    fn chunk_for_symbol(&self, symbol: &str) -> Option<String>;

    fn is_server(&self) -> bool;

    /// Whether the DOM can be re-rendered at all (false for static
    /// snapshots).
    fn can_rerender(&self) -> bool {
        true
    }
}

/// Resolve a chunk URL against a base URL.
pub fn resolve_url(base: Option<&str>, chunk: &str) -> String {
    let absolute = chunk.starts_with('/') || chunk.contains("://");
    match base {
        Some(base) if !absolute && !base.is_empty() => {
            let chunk = chunk.trim_start_matches("./");
            format!("{}/{}", base.trim_end_matches('/'), chunk)
        }
        _ => chunk.to_string(),
    }
}

type Load = Shared<BoxFuture<'static, Result<Value>>>;

/// In-memory module platform.
pub struct ModulePlatform {
    modules: Arc<DashMap<String, IndexMap<String, Value>>>,
    manifest: DashMap<String, String>,
    cache: Mutex<HashMap<String, Load>>,
    loads: Arc<AtomicUsize>,
    server: bool,
    rerender: bool,
}

impl ModulePlatform {
    /// A client platform.
    pub fn new() -> Self {
        Self {
            modules: Arc::new(DashMap::new()),
            manifest: DashMap::new(),
            cache: Mutex::new(HashMap::new()),
            loads: Arc::new(AtomicUsize::new(0)),
            server: false,
            rerender: true,
        }
    }

    /// A server platform: effects never run.
    pub fn server() -> Self {
        Self {
            server: true,
            ..Self::new()
        }
    }

    /// A static snapshot: the DOM can be rendered once but never again.
    pub fn static_snapshot() -> Self {
        Self {
            server: true,
            rerender: false,
            ..Self::new()
        }
    }

    /// Export `symbol` from the module at `url` (the final, resolved URL).
    pub fn register(&self, url: &str, symbol: &str, value: impl Into<Value>) -> &Self {
        self.modules
            .entry(url.to_string())
            .or_default()
            .insert(symbol.to_string(), value.into());
        self
    }

    /// Record that `symbol` is exported by `chunk`.
    pub fn register_manifest(&self, symbol: &str, chunk: &str) -> &Self {
        self.manifest.insert(symbol.to_string(), chunk.to_string());
        self
    }

    /// Number of module loads performed (cache misses).
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Default for ModulePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for ModulePlatform {
    fn import_symbol(
        &self,
        base: Option<&str>,
        chunk: &str,
        symbol: &str,
    ) -> BoxFuture<'static, Result<Value>> {
        let url = resolve_url(base, chunk);
        let key = format!("{url}#{symbol}");
        let load = self
            .cache
            .lock()
            .entry(key)
            .or_insert_with(|| {
                let modules = self.modules.clone();
                let loads = self.loads.clone();
                let symbol = symbol.to_string();
                async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(%url, %symbol, "loading symbol");
                    tokio::task::yield_now().await;
                    let module = modules.get(&url).ok_or_else(|| Error::QrlResolve {
                        chunk: url.clone(),
                        symbol: symbol.clone(),
                        reason: "module not found".into(),
                    })?;
                    module.get(&symbol).cloned().ok_or_else(|| Error::QrlResolve {
                        chunk: url.clone(),
                        symbol: symbol.clone(),
                        reason: "symbol not exported".into(),
                    })
                }
                .boxed()
                .shared()
            })
            .clone();
        load.boxed()
    }

    fn next_tick(&self) -> BoxFuture<'static, ()> {
        tokio::task::yield_now().boxed()
    }

    fn raf(&self) -> BoxFuture<'static, ()> {
        tokio::task::yield_now().boxed()
    }

    fn chunk_for_symbol(&self, symbol: &str) -> Option<String> {
        self.manifest.get(symbol).map(|chunk| chunk.clone())
    }

    fn is_server(&self) -> bool {
        self.server
    }

    fn can_rerender(&self) -> bool {
        self.rerender
    }
}
