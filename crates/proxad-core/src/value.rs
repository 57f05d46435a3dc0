use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;

/// Open-schema value stored in flow attributes and state containers.
///
/// `Counter` wraps a shared atomic integer: cloning the value clones the
/// handle, not the count, so every holder sees the same number. It is the
/// primitive to reach for when several flows mutate the same slot.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    Counter(Arc<AtomicI64>),
}

impl Value {
    pub fn counter() -> Self {
        Value::Counter(Arc::new(AtomicI64::new(0)))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Counter(c) => Some(c.load(Ordering::Relaxed)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(&b[..]),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            // Counters compare by identity: two handles are equal when they
            // observe the same underlying slot.
            (Value::Counter(a), Value::Counter(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

/// Named key/value record whose identity outlives any single filter module
/// load: the host keeps containers in a registry keyed by name, and a
/// reloaded module asking for the same name receives the same container.
///
/// The container serializes individual `get`/`set` operations but nothing
/// more; read-modify-write over plain values races across flows. Use
/// [`StateContainer::counter`] for shared tallies, or store an explicitly
/// locked structure in a slot.
#[derive(Debug)]
pub struct StateContainer {
    name: String,
    slots: RwLock<HashMap<String, Value>>,
}

impl StateContainer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clone the value in `key`, if any. For `Counter` slots the clone shares
    /// the underlying atomic.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Shared atomic integer slot, created at zero on first use. Subsequent
    /// calls (including after a module reload) return a handle to the same
    /// atomic.
    pub fn counter(&self, key: &str) -> Arc<AtomicI64> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let value = slots
            .entry(key.to_owned())
            .or_insert_with(Value::counter);
        match value {
            Value::Counter(c) => Arc::clone(c),
            // A plain value under this key is replaced by a fresh counter.
            other => {
                let c = Arc::new(AtomicI64::new(0));
                *other = Value::Counter(Arc::clone(&c));
                c
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
