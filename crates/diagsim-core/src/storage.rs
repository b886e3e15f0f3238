//! Keyed storage for per-matcher, per-ECU and per-gateway state
//!
//! Handlers keep state between requests (counters, seeds, session flags) in a
//! [`KeyedStorage`] owned by the matcher, interceptor, ECU or gateway they
//! belong to. Values are created lazily on first read and live until the
//! owner is reset.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::error::{SimError, SimResult};

type StoredValue = Box<dyn Any + Send + Sync>;

/// Thread-safe, lazily initialized map from a string key to a typed value
///
/// Every operation holds the internal lock for its whole duration, so a
/// key's initializer runs at most once until the next [`clear`](Self::clear).
/// Initializers and update closures must not access the same storage.
#[derive(Default)]
pub struct KeyedStorage {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl KeyedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value for `key`, materialized with `init` if absent
    pub fn get<T>(&self, key: &str, init: impl FnOnce() -> T) -> SimResult<T>
    where
        T: Any + Send + Sync + Clone,
    {
        self.update(key, init, |value: &mut T| value.clone())
    }

    /// Overwrite the value for `key`
    pub fn set<T>(&self, key: &str, value: T)
    where
        T: Any + Send + Sync,
    {
        self.entries.lock().insert(key.to_string(), Box::new(value));
    }

    /// Apply `f` to the value for `key` in place, materializing it with
    /// `init` first if absent. Read-modify-write cycles done this way cannot
    /// lose updates to concurrent callers.
    pub fn update<T, R>(
        &self,
        key: &str,
        init: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> SimResult<R>
    where
        T: Any + Send + Sync,
    {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            entries.insert(key.to_string(), Box::new(init()));
        }
        entries
            .get_mut(key)
            .and_then(|value| value.downcast_mut::<T>())
            .map(f)
            .ok_or_else(|| SimError::StorageType(key.to_string()))
    }

    /// Whether `key` currently holds a value
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for KeyedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        f.debug_struct("KeyedStorage").field("keys", &keys).finish()
    }
}
