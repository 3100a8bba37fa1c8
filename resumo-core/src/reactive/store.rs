//! Store Implementation
//!
//! A Store is the observable wrapper around a plain object or array. It is
//! the fundamental reactive primitive of the runtime.
//!
//! # How Stores Work
//!
//! 1. Reads go through [`Store::get`] (the read trap). When an ambient
//!    subscriber is running (a component render or a watch) and the store
//!    is not immutable, the subscriber is recorded: unscoped for arrays,
//!    scoped to the read key for objects.
//!
//! 2. Writes go through [`Store::set`] (the write trap). The write trap is
//!    the sole notifier: it compares old and new values and notifies exactly
//!    the subscribers interested in the written key.
//!
//! 3. Exactly one store exists per target. The container keeps the
//!    `target → store` registry, so wrapping is idempotent.

use std::fmt;
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::container::ContainerState;
use crate::error::{Error, Result};
use crate::value::{verify_serializable, Target, Value};

use super::context::InvokeContext;

bitflags! {
    /// Per-store behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProxyFlags: u8 {
        /// Nested objects and arrays are wrapped on read.
        const RECURSIVE = 1 << 0;
        /// Writes are forbidden (component props).
        const IMMUTABLE = 1 << 1;
    }
}

struct StoreInner {
    target: Target,
    flags: ProxyFlags,
    container: Weak<ContainerState>,
}

/// An observable object or array.
///
/// Cloning a store yields another handle to the same proxy.
#[derive(Clone)]
pub struct Store(Arc<StoreInner>);

/// Wrap `value` in the store registered for its target, creating it when
/// needed. Wrapping a store returns it unchanged.
pub fn wrap(value: &Value, flags: ProxyFlags, state: &Arc<ContainerState>) -> Result<Store> {
    match value {
        Value::Store(store) => Ok(store.clone()),
        Value::Object(target) => Ok(state.get_or_create_proxy(target, flags)),
        Value::Qrl(_) | Value::Node(_) | Value::Function(_) | Value::Jsx(_) => {
            Err(Error::OnlyLiteralWrapped(value.type_name().to_string()))
        }
        _ => Err(Error::OnlyObjectWrapped(value.type_name().to_string())),
    }
}

impl Store {
    pub(crate) fn new(target: Target, flags: ProxyFlags, container: Weak<ContainerState>) -> Self {
        Self(Arc::new(StoreInner {
            target,
            flags,
            container,
        }))
    }

    pub fn target(&self) -> &Target {
        &self.0.target
    }

    pub fn flags(&self) -> ProxyFlags {
        self.0.flags
    }

    pub fn is_array(&self) -> bool {
        self.0.target.is_array()
    }

    pub fn ptr_eq(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn container(&self) -> Option<Arc<ContainerState>> {
        self.0.container.upgrade()
    }

    // ------------------------------------------------------------------
    // Read trap
    // ------------------------------------------------------------------

    /// Read `key`, subscribing the ambient subscriber.
    pub fn get(&self, key: &str) -> Value {
        let raw = self.0.target.get(key).unwrap_or_default();
        self.read(Some(key), raw)
    }

    /// Read array element `index`, subscribing the ambient subscriber.
    pub fn index(&self, index: usize) -> Value {
        let raw = self.0.target.get_index(index).unwrap_or_default();
        self.read(None, raw)
    }

    /// Number of fields or elements. Subscribes unscoped.
    pub fn len(&self) -> usize {
        self.track(None);
        self.0.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field names (or indices). Subscribes unscoped.
    pub fn keys(&self) -> Vec<String> {
        self.track(None);
        self.0.target.keys()
    }

    /// Read `key` without subscribing.
    pub fn get_untracked(&self, key: &str) -> Value {
        match self.0.target.get(key).unwrap_or_default() {
            Value::Mutable(inner) => (*inner).clone(),
            raw => self.wrap_nested(raw),
        }
    }

    fn read(&self, key: Option<&str>, raw: Value) -> Value {
        if let Value::Mutable(inner) = raw {
            return (*inner).clone();
        }
        self.track(key);
        self.wrap_nested(raw)
    }

    fn track(&self, key: Option<&str>) {
        if self.0.flags.contains(ProxyFlags::IMMUTABLE) {
            return;
        }
        let Some(subscriber) = InvokeContext::current_subscriber() else {
            return;
        };
        let Some(state) = self.container() else {
            return;
        };
        let key = if self.is_array() { None } else { key };
        state.subs.add_sub(self.0.target.id(), subscriber, key);
    }

    fn wrap_nested(&self, value: Value) -> Value {
        if !self.0.flags.contains(ProxyFlags::RECURSIVE) {
            return value;
        }
        match (&value, self.container()) {
            (Value::Object(target), Some(state)) if !target.is_frozen() => {
                Value::Store(state.get_or_create_proxy(target, self.0.flags))
            }
            _ => value,
        }
    }

    // ------------------------------------------------------------------
    // Write trap
    // ------------------------------------------------------------------

    /// Write `key`. Notifies subscribers of `key` when the value changed.
    ///
    /// On arrays `key` is an index, or `length` to truncate or pad.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.check_write(key, &value)?;
        if self.is_array() {
            return self.write_array(key, value);
        }
        let old = self.0.target.set(key, value.clone());
        if !old.unwrap_or_default().same(&value) {
            self.notify(Some(key));
        }
        Ok(())
    }

    fn write_array(&self, key: &str, value: Value) -> Result<()> {
        if key == "length" {
            let len = value
                .as_f64()
                .filter(|n| n.is_finite() && *n >= 0.0 && n.fract() == 0.0)
                .ok_or_else(|| {
                    Error::InvalidArrayWrite(format!("length {}", value.to_display_string()))
                })?;
            if self.0.target.set_len(len as usize) != len as usize {
                self.notify(None);
            }
            return Ok(());
        }
        let index = key
            .parse::<usize>()
            .map_err(|_| Error::InvalidArrayWrite(format!("key `{key}`")))?;
        self.0.target.set_index(index, value);
        self.notify(None);
        Ok(())
    }

    /// Write array element `index`. Array writes always notify.
    pub fn set_index(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.check_write(&index.to_string(), &value)?;
        let old = self.0.target.set_index(index, value.clone());
        if self.is_array() {
            self.notify(None);
        } else if !old.unwrap_or_default().same(&value) {
            self.notify(Some(&index.to_string()));
        }
        Ok(())
    }

    /// Append to an array.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.check_write("length", &value)?;
        self.0.target.push(value);
        self.notify(None);
        Ok(())
    }

    /// Read-modify-write of `key` without subscribing.
    pub fn update(&self, key: &str, f: impl FnOnce(Value) -> Value) -> Result<()> {
        let current = self.get_untracked(key);
        self.set(key, f(current))
    }

    fn check_write(&self, key: &str, value: &Value) -> Result<()> {
        if self.0.flags.contains(ProxyFlags::IMMUTABLE) {
            return Err(Error::ImmutableProps(key.to_string()));
        }
        let strict = self
            .container()
            .map(|state| state.config.strict_serializable)
            .unwrap_or(true);
        if strict {
            verify_serializable(value)?;
        }
        Ok(())
    }

    /// Write used by the reconciler to update component props. Bypasses the
    /// immutable check and returns whether the value changed.
    pub(crate) fn write_prop(&self, key: &str, value: Value) -> bool {
        let old = self.0.target.set(key, value.clone());
        let changed = !old.unwrap_or_default().same(&value);
        if changed {
            self.notify(Some(key));
        }
        changed
    }

    fn notify(&self, key: Option<&str>) {
        let Some(state) = self.container() else {
            return;
        };
        for subscriber in state.subs.notify_subs(self.0.target.id(), key) {
            state.notify_change(&subscriber);
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("target", &self.0.target)
            .field("flags", &self.0.flags)
            .finish()
    }
}
