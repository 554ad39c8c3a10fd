//! Per-worker state and the keyword-argument bundle.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque mutable key/value bag private to one worker.
///
/// A fresh bag is created every time a worker starts a life (including
/// recycles), handed to the init hook, every task call and the exit hook,
/// and dropped when the life ends. Values can be anything `Send`; typical
/// use is holding a connection or a scratch buffer across tasks.
#[derive(Default)]
pub struct WorkerState {
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl WorkerState {
    /// Create an empty state bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, returning the previous value of the same
    /// type if one was present.
    pub fn insert<V: Any + Send>(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        self.values
            .insert(key.into(), Box::new(value))
            .and_then(|prev| prev.downcast::<V>().ok())
            .map(|prev| *prev)
    }

    /// Borrow the value stored under `key`, if present with type `V`.
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.values.get(key).and_then(|v| v.downcast_ref::<V>())
    }

    /// Mutably borrow the value stored under `key`, if present with type `V`.
    pub fn get_mut<V: Any>(&mut self, key: &str) -> Option<&mut V> {
        self.values.get_mut(key).and_then(|v| v.downcast_mut::<V>())
    }

    /// Remove and return the value stored under `key`, if present with type
    /// `V`.
    pub fn take<V: Any>(&mut self, key: &str) -> Option<V> {
        let boxed = self.values.remove(key)?;
        match boxed.downcast::<V>() {
            Ok(v) => Some(*v),
            Err(boxed) => {
                // Wrong type requested: leave the value where it was.
                self.values.insert(key.to_string(), boxed);
                None
            }
        }
    }

    /// Whether a value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerState")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A named-argument bundle for tasks that take keyword-style inputs.
///
/// Use this as the pool's input element type when elements are maps of
/// argument names to values. Extraction is typed; a missing or ill-typed
/// key fails the task with a descriptive error instead of hanging the job.
///
/// ```
/// use mapforge::Kwargs;
///
/// let kw = Kwargs::new().set("x", 5).set("y", 2);
/// let x: i64 = kw.get("x").unwrap();
/// let y: i64 = kw.get("y").unwrap();
/// assert_eq!(x - y, 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Kwargs(serde_json::Map<String, Value>);

impl Kwargs {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Extract the value stored under `key` as type `V`.
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> anyhow::Result<V> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("missing argument `{key}`"))?;
        serde_json::from_value(value.clone())
            .map_err(|err| anyhow::anyhow!("argument `{key}` has the wrong type: {err}"))
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the bundle is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
