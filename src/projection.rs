//! The materialized key/value projection ("state") built from the log.
//!
//! The repository is the only resource that several partition tasks mutate
//! concurrently. Implementations guarantee per-key atomicity of `put`, `get`
//! and `remove`; there is no multi-key transaction.

use std::collections::HashMap;
use std::sync::RwLock;

/// A concurrency-safe, last-write-wins map from string key to `T`.
pub trait StateRepository<T>: Send + Sync {
    /// Returns a clone of the value stored under `key`.
    fn get(&self, key: &str) -> Option<T>;

    /// Store `value` under `key`, returning the previous value.
    fn put(&self, key: String, value: T) -> Option<T>;

    /// Remove `key`, returning its value.
    fn remove(&self, key: &str) -> Option<T>;

    /// All keys currently present, sorted.
    ///
    /// The listing is a point-in-time view; keys may be added or removed by
    /// concurrent writers after it is taken.
    fn keys(&self) -> Vec<String>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Returns `true` if the repository holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries.
    fn clear(&self);

    /// Visit every entry in key order.
    ///
    /// Keys removed between listing and lookup are skipped, so a concurrent
    /// writer may or may not be reflected in one iteration.
    fn for_each(&self, f: &mut dyn FnMut(&str, &T)) {
        for key in self.keys() {
            if let Some(value) = self.get(&key) {
                f(&key, &value);
            }
        }
    }
}

/// In-memory [`StateRepository`] guarded by a read/write lock.
#[derive(Debug)]
pub struct InMemoryStateRepository<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T> InMemoryStateRepository<T> {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for InMemoryStateRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> InMemoryStateRepository<T> {
    /// Clone the full contents into a plain map.
    pub fn to_map(&self) -> HashMap<String, T> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, T>> {
        // A panicking writer cannot leave a half-applied single-key update
        // behind, so a poisoned lock is still consistent.
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, T>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone + Send + Sync> StateRepository<T> for InMemoryStateRepository<T> {
    fn get(&self, key: &str) -> Option<T> {
        self.read().get(key).cloned()
    }

    fn put(&self, key: String, value: T) -> Option<T> {
        self.write().insert(key, value)
    }

    fn remove(&self, key: &str) -> Option<T> {
        self.write().remove(key)
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn clear(&self) {
        self.write().clear();
    }
}
