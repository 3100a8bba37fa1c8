//! Value Model
//!
//! Application state is dynamic: stores hold plain objects and arrays whose
//! fields can be primitives, nested objects, lazy references or DOM nodes.
//! [`Value`] is the single currency type flowing through stores, props,
//! sequential slots, QRL captures and the serializer.
//!
//! # Identity
//!
//! Reference-like values (targets, stores, QRLs, nodes, functions) compare by
//! identity in [`Value::same`]; primitives compare by value. Targets carry a
//! process-unique [`TargetId`] so identity tables never hash pointers.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::dom::Node;
use crate::error::{Error, Result};
use crate::qrl::Qrl;
use crate::reactive::Store;
use crate::render::JsxNode;

/// Unique identifier for a raw store target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u64);

impl TargetId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Contents of a target.
#[derive(Debug, Clone)]
pub enum TargetData {
    Object(IndexMap<String, Value>),
    Array(Vec<Value>),
}

struct TargetInner {
    id: TargetId,
    frozen: AtomicBool,
    data: RwLock<TargetData>,
}

/// A plain object or array: the raw data behind a store.
#[derive(Clone)]
pub struct Target(Arc<TargetInner>);

impl Target {
    fn with_data(data: TargetData) -> Self {
        Self(Arc::new(TargetInner {
            id: TargetId::next(),
            frozen: AtomicBool::new(false),
            data: RwLock::new(data),
        }))
    }

    /// An empty plain object.
    pub fn object() -> Self {
        Self::with_data(TargetData::Object(IndexMap::new()))
    }

    /// An array holding `items`.
    pub fn array(items: Vec<Value>) -> Self {
        Self::with_data(TargetData::Array(items))
    }

    pub fn from_entries<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        let map = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self::with_data(TargetData::Object(map))
    }

    pub fn id(&self) -> TargetId {
        self.0.id
    }

    pub fn is_array(&self) -> bool {
        matches!(*self.0.data.read(), TargetData::Array(_))
    }

    /// Frozen targets are never auto-wrapped by recursive stores.
    pub fn freeze(&self) {
        self.0.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match &*self.0.data.read() {
            TargetData::Object(map) => map.get(key).cloned(),
            TargetData::Array(items) => match key {
                "length" => Some(Value::from(items.len())),
                _ => key.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
            },
        }
    }

    pub fn get_index(&self, index: usize) -> Option<Value> {
        match &*self.0.data.read() {
            TargetData::Object(map) => map.get(&index.to_string()).cloned(),
            TargetData::Array(items) => items.get(index).cloned(),
        }
    }

    /// Write a field, returning the previous value.
    pub fn set(&self, key: &str, value: Value) -> Option<Value> {
        match &mut *self.0.data.write() {
            TargetData::Object(map) => map.insert(key.to_string(), value),
            TargetData::Array(items) => match key.parse::<usize>() {
                Ok(index) => set_slot(items, index, value),
                Err(_) => None,
            },
        }
    }

    pub fn set_index(&self, index: usize, value: Value) -> Option<Value> {
        match &mut *self.0.data.write() {
            TargetData::Object(map) => map.insert(index.to_string(), value),
            TargetData::Array(items) => set_slot(items, index, value),
        }
    }

    /// Truncate or pad an array to `len`, returning the previous length.
    /// Objects are left untouched.
    pub(crate) fn set_len(&self, len: usize) -> usize {
        match &mut *self.0.data.write() {
            TargetData::Object(map) => map.len(),
            TargetData::Array(items) => {
                let old = items.len();
                items.resize(len, Value::Undefined);
                old
            }
        }
    }

    pub fn push(&self, value: Value) {
        match &mut *self.0.data.write() {
            TargetData::Object(map) => {
                let key = map.len().to_string();
                map.insert(key, value);
            }
            TargetData::Array(items) => items.push(value),
        }
    }

    pub fn len(&self) -> usize {
        match &*self.0.data.read() {
            TargetData::Object(map) => map.len(),
            TargetData::Array(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        match &*self.0.data.read() {
            TargetData::Object(map) => map.keys().cloned().collect(),
            TargetData::Array(items) => (0..items.len()).map(|i| i.to_string()).collect(),
        }
    }

    /// Every value held by the target, in order.
    pub fn values(&self) -> Vec<Value> {
        match &*self.0.data.read() {
            TargetData::Object(map) => map.values().cloned().collect(),
            TargetData::Array(items) => items.clone(),
        }
    }

    /// Snapshot of the contents.
    pub fn data(&self) -> TargetData {
        self.0.data.read().clone()
    }

    pub(crate) fn replace(&self, data: TargetData) {
        *self.0.data.write() = data;
    }

    pub fn ptr_eq(&self, other: &Target) -> bool {
        self.0.id == other.0.id
    }
}

fn set_slot(items: &mut Vec<Value>, index: usize, value: Value) -> Option<Value> {
    if index >= items.len() {
        items.resize(index + 1, Value::Undefined);
        items[index] = value;
        None
    } else {
        Some(std::mem::replace(&mut items[index], value))
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.data.read() {
            TargetData::Object(map) => f.debug_map().entries(map.iter()).finish(),
            TargetData::Array(items) => f.debug_list().entries(items.iter()).finish(),
        }
    }
}

/// Future returned by a [`Func`].
pub type FuncFuture = BoxFuture<'static, Result<Value>>;

/// A callable value: event handlers, render functions, watch bodies and
/// cleanup callbacks.
#[derive(Clone)]
pub struct Func(Arc<dyn Fn(Vec<Value>) -> FuncFuture + Send + Sync>);

impl Func {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> FuncFuture + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Adapt a synchronous closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(move |args| future::ready(f(args)).boxed())
    }

    pub fn call(&self, args: Vec<Value>) -> FuncFuture {
        (self.0)(args)
    }

    pub fn ptr_eq(&self, other: &Func) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Func({:p})", Arc::as_ptr(&self.0))
    }
}

/// A dynamic value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    /// A raw (unwrapped) plain object or array.
    Object(Target),
    /// A wrapped, observable object or array.
    Store(Store),
    Qrl(Qrl),
    Node(Node),
    Function(Func),
    /// Explicit-mutable wrapper: read through a store without subscribing.
    Mutable(Arc<Value>),
    Jsx(JsxNode),
}

/// Wrap a value as explicit-mutable.
pub fn mutable(value: impl Into<Value>) -> Value {
    Value::Mutable(Arc::new(value.into()))
}

impl Value {
    /// A raw plain object built from `entries`.
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(Target::from_entries(entries))
    }

    /// A raw array.
    pub fn array(items: Vec<Value>) -> Self {
        Value::Object(Target::array(items))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_store(&self) -> Option<&Store> {
        match self {
            Value::Store(store) => Some(store),
            _ => None,
        }
    }

    pub fn as_target(&self) -> Option<&Target> {
        match self {
            Value::Object(target) => Some(target),
            Value::Store(store) => Some(store.target()),
            _ => None,
        }
    }

    pub fn as_qrl(&self) -> Option<&Qrl> {
        match self {
            Value::Qrl(qrl) => Some(qrl),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<&Func> {
        match self {
            Value::Function(func) => Some(func),
            _ => None,
        }
    }

    /// JavaScript-style truthiness.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Mutable(inner) => inner.truthy(),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(t) if t.is_array() => "array",
            Value::Object(_) => "object",
            Value::Store(_) => "store",
            Value::Qrl(_) => "qrl",
            Value::Node(_) => "node",
            Value::Function(_) => "function",
            Value::Mutable(_) => "mutable",
            Value::Jsx(_) => "jsx",
        }
    }

    /// String conversion used for text nodes and attributes.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::Mutable(inner) => inner.to_display_string(),
            Value::Object(t) if t.is_array() => t
                .values()
                .iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join(","),
            Value::Store(s) if s.target().is_array() => Value::Object(s.target().clone()).to_display_string(),
            _ => format!("[{}]", self.type_name()),
        }
    }

    /// Reference/value equality (`===`).
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Store(a), Value::Store(b)) => a.ptr_eq(b),
            (Value::Qrl(a), Value::Qrl(b)) => a.ptr_eq(b),
            (Value::Node(a), Value::Node(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Mutable(a), Value::Mutable(b)) => Arc::ptr_eq(a, b) || a.same(b),
            (Value::Jsx(a), Value::Jsx(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Check that `value` can be captured by the serializer.
///
/// Primitives, plain objects and arrays, stores, lazy references and DOM
/// nodes are serializable. Functions, JSX trees and non-finite numbers are
/// not.
pub fn verify_serializable(value: &Value) -> Result<()> {
    let mut seen = HashSet::new();
    let mut stack = vec![value.clone()];
    while let Some(value) = stack.pop() {
        match value {
            Value::Function(_) | Value::Jsx(_) => {
                return Err(Error::VerifySerializable(value.type_name().to_string()))
            }
            Value::Number(n) if !n.is_finite() => {
                return Err(Error::VerifySerializable(format_number(n)))
            }
            Value::Mutable(inner) => stack.push((*inner).clone()),
            Value::Object(target) => {
                if seen.insert(target.id()) {
                    stack.extend(target.values());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Object(t) => write!(f, "{t:?}"),
            Value::Store(s) => write!(f, "Store({:?})", s.target()),
            Value::Qrl(q) => write!(f, "{q:?}"),
            Value::Node(n) => write!(f, "{n:?}"),
            Value::Function(func) => write!(f, "{func:?}"),
            Value::Mutable(inner) => write!(f, "mutable({inner:?})"),
            Value::Jsx(node) => write!(f, "{node:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<Target> for Value {
    fn from(t: Target) -> Self {
        Value::Object(t)
    }
}

impl From<Store> for Value {
    fn from(s: Store) -> Self {
        Value::Store(s)
    }
}

impl From<Qrl> for Value {
    fn from(q: Qrl) -> Self {
        Value::Qrl(q)
    }
}

impl From<Node> for Value {
    fn from(n: Node) -> Self {
        Value::Node(n)
    }
}

impl From<Func> for Value {
    fn from(f: Func) -> Self {
        Value::Function(f)
    }
}

impl From<JsxNode> for Value {
    fn from(node: JsxNode) -> Self {
        Value::Jsx(node)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Undefined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_compares_primitives_by_value() {
        assert!(Value::from(1).same(&Value::from(1.0)));
        assert!(Value::from("a").same(&Value::from("a")));
        assert!(!Value::from(1).same(&Value::from("1")));
        assert!(!Value::Null.same(&Value::Undefined));
    }

    #[test]
    fn same_compares_objects_by_identity() {
        let a = Value::object([("x", Value::from(1))]);
        let b = Value::object([("x", Value::from(1))]);
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }

    #[test]
    fn numbers_display_like_javascript() {
        assert_eq!(Value::from(1).to_display_string(), "1");
        assert_eq!(Value::from(1.5).to_display_string(), "1.5");
        assert_eq!(Value::from(f64::NAN).to_display_string(), "NaN");
    }

    #[test]
    fn arrays_grow_on_out_of_range_writes() {
        let target = Target::array(vec![]);
        target.set_index(2, Value::from("c"));
        assert_eq!(target.len(), 3);
        assert!(target.get_index(0).unwrap().is_undefined());
        assert_eq!(target.get("length").unwrap().as_f64(), Some(3.0));
    }

    #[test]
    fn functions_are_not_serializable() {
        let func = Value::Function(Func::sync(|_| Ok(Value::Undefined)));
        let nested = Value::object([("handler", func.clone())]);
        assert!(verify_serializable(&Value::from(3)).is_ok());
        assert!(matches!(
            verify_serializable(&func),
            Err(Error::VerifySerializable(_))
        ));
        assert!(verify_serializable(&nested).is_err());
    }

    #[test]
    fn non_finite_numbers_are_not_serializable() {
        for n in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                verify_serializable(&Value::from(n)),
                Err(Error::VerifySerializable(_))
            ));
        }
        let nested = Value::array(vec![Value::from(1.5), Value::from(f64::NAN)]);
        assert!(verify_serializable(&nested).is_err());
        assert!(verify_serializable(&Value::from(-0.5)).is_ok());
    }
}
