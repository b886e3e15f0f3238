//! Interceptors
//!
//! Interceptors are time-bounded callbacks registered on a running ECU. They
//! see every inbound request before the request matchers do, and the first
//! one reporting the request as handled decides the response.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::control::EcuControl;
use crate::error::SimResult;
use crate::registry::RequestsData;
use crate::request::DiagRequest;
use crate::response::{Caller, ResponseContext};
use crate::storage::KeyedStorage;

/// Callback deciding whether an interceptor handles a request
pub type InterceptorHandler =
    Arc<dyn Fn(&mut ResponseContext<'_>) -> SimResult<bool> + Send + Sync>;

/// A named, optionally expiring request interceptor
pub struct Interceptor {
    name: String,
    duration: Option<Duration>,
    also_call_when_busy: bool,
    handler: InterceptorHandler,
    storage: KeyedStorage,
}

impl Interceptor {
    /// Interceptor with a generated name that never expires and is skipped
    /// while the ECU is busy
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&mut ResponseContext<'_>) -> SimResult<bool> + Send + Sync + 'static,
    {
        Self {
            name: Uuid::new_v4().to_string(),
            duration: None,
            also_call_when_busy: false,
            handler: Arc::new(handler),
            storage: KeyedStorage::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Stop taking effect once `duration` has elapsed after registration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Keep running while the ECU is busy
    pub fn also_call_when_busy(mut self, value: bool) -> Self {
        self.also_call_when_busy = value;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` means the interceptor never expires
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn is_called_when_busy(&self) -> bool {
        self.also_call_when_busy
    }

    pub fn storage(&self) -> &KeyedStorage {
        &self.storage
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("name", &self.name)
            .field("duration", &self.duration)
            .field("also_call_when_busy", &self.also_call_when_busy)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct Registration {
    interceptor: Arc<Interceptor>,
    registered_at: Instant,
}

impl Registration {
    fn is_expired_at(&self, now: Instant) -> bool {
        match self.interceptor.duration {
            Some(duration) => match self.registered_at.checked_add(duration) {
                Some(expires_at) => now >= expires_at,
                None => false,
            },
            None => false,
        }
    }
}

/// Ordered set of interceptors registered on one ECU
///
/// Interceptors are tried in registration order. Re-registering a name
/// replaces the earlier interceptor and moves it to the end. Expired
/// entries are dropped lazily when a request is offered.
#[derive(Default)]
pub struct InterceptorSet {
    entries: RwLock<Vec<Registration>>,
}

impl InterceptorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `interceptor` now; returns its name
    pub fn add(&self, interceptor: Interceptor) -> String {
        self.add_at(interceptor, Instant::now())
    }

    /// Register `interceptor` as if registered at `registered_at`
    pub fn add_at(&self, interceptor: Interceptor, registered_at: Instant) -> String {
        let name = interceptor.name.clone();
        let mut entries = self.entries.write();
        entries.retain(|entry| entry.interceptor.name != name);
        debug!(
            interceptor = %name,
            duration = ?interceptor.duration,
            "Interceptor registered"
        );
        entries.push(Registration {
            interceptor: Arc::new(interceptor),
            registered_at,
        });
        name
    }

    /// Remove an interceptor by name
    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.interceptor.name != name);
        let removed = entries.len() != before;
        if removed {
            debug!(interceptor = %name, "Interceptor removed");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Names in the order they are tried
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.interceptor.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Offer `request` to the active interceptors at the current time
    pub fn offer(
        &self,
        request: &DiagRequest,
        busy: bool,
        ecu: &dyn EcuControl,
        registry: &RequestsData,
    ) -> SimResult<Option<Vec<u8>>> {
        self.offer_at(request, busy, ecu, registry, Instant::now())
    }

    /// Offer `request` to the interceptors active at `now`.
    ///
    /// Returns `Some(response)` when an interceptor handled the request (an
    /// empty response means it was handled silently) and `None` when the
    /// request should go on to the request matchers. An interceptor that
    /// reports the request as handled but calls `continue_matching(true)`
    /// passes it on to the next interceptor and then to the matchers; any
    /// response it wrote is not sent.
    pub fn offer_at(
        &self,
        request: &DiagRequest,
        busy: bool,
        ecu: &dyn EcuControl,
        registry: &RequestsData,
        now: Instant,
    ) -> SimResult<Option<Vec<u8>>> {
        self.purge_expired(now);

        // Handlers may register or remove interceptors, so run them on a snapshot
        let active: Vec<Registration> = self.entries.read().clone();

        for entry in active {
            let interceptor = entry.interceptor.as_ref();
            if busy && !interceptor.also_call_when_busy {
                continue;
            }

            let mut ctx =
                ResponseContext::new(Caller::Interceptor(interceptor), request, ecu, registry);
            if !(interceptor.handler)(&mut ctx)? {
                continue;
            }

            let (response, continue_matching) = ctx.into_parts();
            if continue_matching {
                debug!(
                    ecu = %ecu.name(),
                    interceptor = %interceptor.name,
                    "Interceptor passed the request on"
                );
                continue;
            }

            debug!(
                ecu = %ecu.name(),
                interceptor = %interceptor.name,
                "Request handled by interceptor"
            );
            return Ok(Some(response));
        }

        Ok(None)
    }

    fn purge_expired(&self, now: Instant) {
        let has_expired = self
            .entries
            .read()
            .iter()
            .any(|entry| entry.is_expired_at(now));
        if !has_expired {
            return;
        }

        self.entries.write().retain(|entry| {
            let expired = entry.is_expired_at(now);
            if expired {
                debug!(interceptor = %entry.interceptor.name, "Interceptor expired");
            }
            !expired
        });
    }
}

impl fmt::Debug for InterceptorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorSet")
            .field("names", &self.names())
            .finish()
    }
}
