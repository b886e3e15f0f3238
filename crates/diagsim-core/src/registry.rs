//! Request registries
//!
//! [`RequestsData`] holds the ordered request matchers and reset handlers of
//! one simulated entity together with its matching defaults. [`EcuData`]
//! adds ECU addressing, [`GatewayData`] groups a gateway entity with the
//! ECUs behind it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::control::EcuControl;
use crate::error::{SimError, SimResult};
use crate::matcher::RequestMatcher;
use crate::request::DiagRequest;
use crate::response::{Caller, ResponseContext};
use crate::storage::KeyedStorage;
use crate::uds::{negative_response, NegativeResponseCode, DEFAULT_ACK_BYTES};

/// Default number of request bytes rendered for regex matching
pub const DEFAULT_REGEX_MATCH_BYTES: usize = 10;

/// Callback invoked when the owning ECU is reset
pub type ResetHandlerFn = Arc<dyn Fn(&dyn EcuControl) -> SimResult<()> + Send + Sync>;

/// A named reset callback
#[derive(Clone)]
pub struct ResetHandler {
    pub name: Option<String>,
    pub handler: ResetHandlerFn,
}

impl fmt::Debug for ResetHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetHandler")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered request matchers plus matching defaults for one entity
///
/// Definition order is match priority. The matcher and reset handler lists
/// may change while requests are dispatched; a dispatch works on a snapshot
/// taken when it starts.
pub struct RequestsData {
    name: String,
    nrc_on_no_match: bool,
    request_regex_match_bytes: usize,
    ack_bytes_lengths: HashMap<u8, usize>,
    requests: RwLock<Vec<Arc<RequestMatcher>>>,
    reset_handlers: RwLock<Vec<ResetHandler>>,
}

impl RequestsData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nrc_on_no_match: true,
            request_regex_match_bytes: DEFAULT_REGEX_MATCH_BYTES,
            ack_bytes_lengths: HashMap::new(),
            requests: RwLock::new(Vec::new()),
            reset_handlers: RwLock::new(Vec::new()),
        }
    }

    /// Answer unmatched requests with GeneralReject (default) or stay silent
    pub fn with_nrc_on_no_match(mut self, value: bool) -> Self {
        self.nrc_on_no_match = value;
        self
    }

    pub fn with_request_regex_match_bytes(mut self, bytes: usize) -> Self {
        self.request_regex_match_bytes = bytes;
        self
    }

    /// Number of request bytes (including the service id) echoed by
    /// `ack` for `service_id`
    pub fn with_ack_bytes_length(mut self, service_id: u8, bytes: usize) -> Self {
        self.ack_bytes_lengths.insert(service_id, bytes);
        self
    }

    pub fn with_ack_bytes_lengths(mut self, lengths: impl IntoIterator<Item = (u8, usize)>) -> Self {
        self.ack_bytes_lengths.extend(lengths);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nrc_on_no_match(&self) -> bool {
        self.nrc_on_no_match
    }

    pub fn request_regex_match_bytes(&self) -> usize {
        self.request_regex_match_bytes
    }

    /// Acknowledgement length for `service_id`, [`DEFAULT_ACK_BYTES`] if unset
    pub fn ack_bytes_length(&self, service_id: u8) -> usize {
        self.ack_bytes_lengths
            .get(&service_id)
            .copied()
            .unwrap_or(DEFAULT_ACK_BYTES)
    }

    /// Append a matcher; it is tried after all existing ones
    pub fn add_request(&self, matcher: RequestMatcher) -> Arc<RequestMatcher> {
        let matcher = Arc::new(matcher);
        self.requests.write().push(matcher.clone());
        matcher
    }

    /// Append a matcher from the string form (hex literal or template)
    pub fn request<F>(&self, request: &str, handler: F) -> SimResult<Arc<RequestMatcher>>
    where
        F: Fn(&mut ResponseContext<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        Ok(self.add_request(RequestMatcher::parse(request, handler)?))
    }

    /// Append a named matcher from the string form
    pub fn named_request<F>(
        &self,
        name: &str,
        request: &str,
        handler: F,
    ) -> SimResult<Arc<RequestMatcher>>
    where
        F: Fn(&mut ResponseContext<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        Ok(self.add_request(RequestMatcher::parse(request, handler)?.with_name(name)))
    }

    /// Append an exact byte matcher
    pub fn request_bytes<F>(&self, bytes: impl Into<Vec<u8>>, handler: F) -> Arc<RequestMatcher>
    where
        F: Fn(&mut ResponseContext<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        self.add_request(RequestMatcher::exact(bytes, handler))
    }

    /// Snapshot of the matchers in match order
    pub fn requests(&self) -> Vec<Arc<RequestMatcher>> {
        self.requests.read().clone()
    }

    /// First matcher with the given name
    pub fn find_request(&self, name: &str) -> Option<Arc<RequestMatcher>> {
        self.requests
            .read()
            .iter()
            .find(|matcher| matcher.name() == Some(name))
            .cloned()
    }

    /// Remove every matcher with the given name
    pub fn remove_request(&self, name: &str) -> bool {
        let mut requests = self.requests.write();
        let before = requests.len();
        requests.retain(|matcher| matcher.name() != Some(name));
        requests.len() != before
    }

    /// Register a callback run on every reset, after existing ones
    pub fn on_reset<F>(&self, name: Option<&str>, handler: F)
    where
        F: Fn(&dyn EcuControl) -> SimResult<()> + Send + Sync + 'static,
    {
        self.reset_handlers.write().push(ResetHandler {
            name: name.map(str::to_string),
            handler: Arc::new(handler),
        });
    }

    pub fn reset_handlers(&self) -> Vec<ResetHandler> {
        self.reset_handlers.read().clone()
    }

    /// Clear the storage of every matcher
    pub fn reset_requests(&self) {
        for matcher in self.requests() {
            matcher.reset();
        }
    }

    /// Clear every matcher's storage, then run the reset handlers in
    /// registration order. Stops at the first failing handler.
    pub fn reset(&self, ecu: &dyn EcuControl) -> SimResult<()> {
        self.reset_requests();
        for reset_handler in self.reset_handlers() {
            debug!(
                registry = %self.name,
                handler = ?reset_handler.name,
                "Running reset handler"
            );
            (reset_handler.handler)(ecu)?;
        }
        Ok(())
    }

    /// Run `request` through the matchers.
    ///
    /// The first matching matcher's handler decides the response. A handler
    /// that calls `continue_matching(true)` passes the request on to the
    /// next matching matcher. The last non-empty response written along the
    /// chain is sent, so a final handler that only updates state keeps the
    /// response of an earlier one. Without any response a GeneralReject is
    /// produced when `nrc_on_no_match` is set.
    ///
    /// Returns `None` when nothing is to be sent.
    pub fn dispatch(
        &self,
        request: &DiagRequest,
        ecu: &dyn EcuControl,
    ) -> SimResult<Option<Vec<u8>>> {
        let mut carried: Option<Vec<u8>> = None;

        for matcher in self.requests() {
            if !matcher.matches(&request.payload, self.request_regex_match_bytes) {
                continue;
            }

            debug!(
                ecu = %ecu.name(),
                matcher = matcher.name().unwrap_or("<unnamed>"),
                pattern = %matcher.pattern(),
                "Request matched"
            );

            let mut ctx = ResponseContext::new(Caller::Matcher(&matcher), request, ecu, self);
            matcher.handle(&mut ctx)?;
            let (response, continue_matching) = ctx.into_parts();

            if continue_matching {
                if !response.is_empty() {
                    carried = Some(response);
                }
                continue;
            }

            if response.is_empty() {
                return Ok(carried);
            }
            return Ok(Some(response));
        }

        if carried.is_some() {
            return Ok(carried);
        }

        if self.nrc_on_no_match {
            let sid = request.service_id()?;
            info!(
                ecu = %ecu.name(),
                request = %request.hex(),
                "No matching request, sending GeneralReject"
            );
            Ok(Some(negative_response(sid, NegativeResponseCode::GeneralReject)))
        } else {
            debug!(ecu = %ecu.name(), request = %request.hex(), "No matching request");
            Ok(None)
        }
    }
}

impl fmt::Debug for RequestsData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestsData")
            .field("name", &self.name)
            .field("nrc_on_no_match", &self.nrc_on_no_match)
            .field("request_regex_match_bytes", &self.request_regex_match_bytes)
            .field("ack_bytes_lengths", &self.ack_bytes_lengths)
            .field("requests", &self.requests.read().len())
            .field("reset_handlers", &self.reset_handlers.read().len())
            .finish()
    }
}

/// Configuration of one simulated ECU
#[derive(Debug)]
pub struct EcuData {
    registry: RequestsData,
    physical_address: u16,
    functional_address: u16,
    storage: KeyedStorage,
}

impl EcuData {
    pub fn new(registry: RequestsData, physical_address: u16, functional_address: u16) -> Self {
        Self {
            registry,
            physical_address,
            functional_address,
            storage: KeyedStorage::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.registry.name()
    }

    pub fn physical_address(&self) -> u16 {
        self.physical_address
    }

    pub fn functional_address(&self) -> u16 {
        self.functional_address
    }

    pub fn registry(&self) -> &RequestsData {
        &self.registry
    }

    /// ECU-level storage
    pub fn storage(&self) -> &KeyedStorage {
        &self.storage
    }
}

/// Configuration of a gateway and the ECUs behind it
///
/// The gateway is itself addressable; its own requests live in `entity`.
#[derive(Debug)]
pub struct GatewayData {
    entity: Arc<EcuData>,
    ecus: Vec<Arc<EcuData>>,
}

impl GatewayData {
    pub fn new(entity: EcuData) -> Self {
        Self {
            entity: Arc::new(entity),
            ecus: Vec::new(),
        }
    }

    /// Add an ECU behind this gateway
    pub fn with_ecu(mut self, ecu: EcuData) -> Self {
        self.ecus.push(Arc::new(ecu));
        self
    }

    pub fn name(&self) -> &str {
        self.entity.name()
    }

    /// The gateway's own diagnostic entity
    pub fn entity(&self) -> &Arc<EcuData> {
        &self.entity
    }

    pub fn ecus(&self) -> &[Arc<EcuData>] {
        &self.ecus
    }

    pub fn ecu(&self, name: &str) -> Option<&Arc<EcuData>> {
        self.ecus.iter().find(|ecu| ecu.name() == name)
    }

    /// Gateway-level storage
    pub fn storage(&self) -> &KeyedStorage {
        self.entity.storage()
    }

    /// Reject duplicate names or physical addresses among the gateway and
    /// its ECUs
    pub fn validate(&self) -> SimResult<()> {
        let mut names = HashSet::new();
        let mut addresses = HashSet::new();

        for ecu in std::iter::once(&self.entity).chain(self.ecus.iter()) {
            if !names.insert(ecu.name()) {
                return Err(SimError::InvalidConfig(format!(
                    "gateway '{}': duplicate ECU name '{}'",
                    self.name(),
                    ecu.name()
                )));
            }
            if !addresses.insert(ecu.physical_address()) {
                return Err(SimError::InvalidConfig(format!(
                    "gateway '{}': duplicate physical address 0x{:04X} ({})",
                    self.name(),
                    ecu.physical_address(),
                    ecu.name()
                )));
            }
        }
        Ok(())
    }
}
