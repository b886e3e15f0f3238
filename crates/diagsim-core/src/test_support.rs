//! In-memory [`EcuControl`] used by unit tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::control::{EcuControl, TimerTask};
use crate::error::SimResult;
use crate::interceptor::{Interceptor, InterceptorSet};
use crate::storage::KeyedStorage;

/// Records timers and sent frames instead of running them
pub struct StubEcu {
    name: String,
    storage: KeyedStorage,
    interceptors: InterceptorSet,
    timers: Mutex<BTreeMap<String, (Duration, TimerTask)>>,
    busy: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl StubEcu {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_interceptors(name, InterceptorSet::new())
    }

    pub fn with_interceptors(name: impl Into<String>, interceptors: InterceptorSet) -> Self {
        Self {
            name: name.into(),
            storage: KeyedStorage::new(),
            interceptors,
            timers: Mutex::new(BTreeMap::new()),
            busy: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn interceptors(&self) -> &InterceptorSet {
        &self.interceptors
    }

    pub fn timer_names(&self) -> Vec<String> {
        self.timers.lock().keys().cloned().collect()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Run a pending timer right away. Returns `false` if none was pending.
    pub fn fire_timer(&self, name: &str) -> SimResult<bool> {
        let Some((_, task)) = self.timers.lock().remove(name) else {
            return Ok(false);
        };
        let control: &dyn EcuControl = self;
        task(control)?;
        Ok(true)
    }
}

impl EcuControl for StubEcu {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage(&self) -> &KeyedStorage {
        &self.storage
    }

    fn add_or_replace_timer(&self, name: &str, delay: Duration, task: TimerTask) -> SimResult<()> {
        self.timers.lock().insert(name.to_string(), (delay, task));
        Ok(())
    }

    fn cancel_timer(&self, name: &str) -> bool {
        self.timers.lock().remove(name).is_some()
    }

    fn add_interceptor(&self, interceptor: Interceptor) -> String {
        self.interceptors.add(interceptor)
    }

    fn remove_interceptor(&self, name: &str) -> bool {
        self.interceptors.remove(name)
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    fn send(&self, payload: Vec<u8>) {
        self.sent.lock().push(payload);
    }
}
