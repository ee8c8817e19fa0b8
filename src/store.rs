//! Shared result store.
//!
//! A thread-safe key/value store for state that travels outside the formal
//! step-output channel (cross-cutting counters, flags inspected by hooks).
//! Each run gets its own instance, passed explicitly to step bodies and
//! hooks; there is no process-wide singleton.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

/// Callback invoked after a key's value changes.
type Listener = dyn Fn(&str, &Value) + Send + Sync;

/// Thread-safe key/value store shared by all steps of one run.
///
/// Individual operations are atomic. A compound read-then-write across
/// separate `get` + `set` calls is NOT serialized against concurrent
/// mutators; use [`SharedStore::update`] for that.
#[derive(Default)]
pub struct SharedStore {
    entries: RwLock<HashMap<String, Value>>,
    listeners: RwLock<HashMap<String, Vec<Arc<Listener>>>>,
}

impl SharedStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().unwrap().get(key).cloned()
    }

    /// Set a value, replacing any previous one. Listeners for the key fire
    /// after the write commits.
    pub fn set(&self, key: &str, value: Value) {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), value.clone());
        self.notify(key, &value);
    }

    /// Remove a key, returning its previous value.
    pub fn delete(&self, key: &str) -> Option<Value> {
        self.entries.write().unwrap().remove(key)
    }

    /// Remove all entries. Listeners are kept.
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    /// Atomically read-modify-write a key.
    ///
    /// The closure receives the current value (None if absent) and returns
    /// the new one. The whole sequence runs under the write lock, so no
    /// concurrent mutator can interleave. Returns the stored value.
    pub fn update<F>(&self, key: &str, f: F) -> Value
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let value = {
            let mut entries = self.entries.write().unwrap();
            let next = f(entries.get(key));
            entries.insert(key.to_string(), next.clone());
            next
        };
        self.notify(key, &value);
        value
    }

    /// Subscribe to changes of a key. Callbacks run in registration order,
    /// outside the store lock, on the mutating thread.
    pub fn subscribe<F>(&self, key: &str, callback: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, key: &str, value: &Value) {
        let subscribed: Vec<Arc<Listener>> = self
            .listeners
            .read()
            .unwrap()
            .get(key)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        for listener in subscribed {
            listener(key, value);
        }
    }
}
