//! Runtime ECU
//!
//! [`SimEcu`] is the running counterpart of an [`EcuData`] definition. It
//! owns the state that only exists while the simulation runs: pending
//! timers, registered interceptors, the busy flag and the outbound channel
//! used for frames sent outside the request/response cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use diagsim_core::uds::negative_response;
use diagsim_core::{
    to_hex_upper, DiagRequest, EcuControl, EcuData, Interceptor, InterceptorSet, KeyedStorage,
    NegativeResponseCode, RequestsData, SimError, SimResult, TimerTask,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the outbound frame channel
const OUTBOUND_CAPACITY: usize = 64;

/// A frame emitted by an ECU outside the request/response cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Name of the sending ECU
    pub ecu: String,
    /// Physical address of the sending ECU
    pub source_address: u16,
    pub payload: Vec<u8>,
}

struct TimerEntry {
    id: u64,
    handle: JoinHandle<()>,
}

/// A simulated ECU at runtime
pub struct SimEcu {
    data: Arc<EcuData>,
    interceptors: InterceptorSet,
    timers: Mutex<HashMap<String, TimerEntry>>,
    next_timer_id: AtomicU64,
    busy: AtomicBool,
    outbound: broadcast::Sender<OutboundFrame>,
    self_ref: Weak<SimEcu>,
}

impl SimEcu {
    pub fn new(data: Arc<EcuData>) -> Arc<Self> {
        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        Arc::new_cyclic(|self_ref| Self {
            data,
            interceptors: InterceptorSet::new(),
            timers: Mutex::new(HashMap::new()),
            next_timer_id: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            outbound,
            self_ref: self_ref.clone(),
        })
    }

    pub fn data(&self) -> &Arc<EcuData> {
        &self.data
    }

    pub fn registry(&self) -> &RequestsData {
        self.data.registry()
    }

    pub fn physical_address(&self) -> u16 {
        self.data.physical_address()
    }

    pub fn functional_address(&self) -> u16 {
        self.data.functional_address()
    }

    /// Receive frames sent via [`EcuControl::send`]
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundFrame> {
        self.outbound.subscribe()
    }

    /// Decide the response to `request`.
    ///
    /// Interceptors see the request first. While the ECU is busy (or the
    /// transport flags the request as busy) and no interceptor handles it,
    /// the answer is BusyRepeatRequest; otherwise the request matchers
    /// decide. `None` means nothing is sent.
    pub fn handle_request(&self, request: &DiagRequest) -> SimResult<Option<Vec<u8>>> {
        let busy = request.busy || self.is_busy();
        let registry = self.data.registry();

        if let Some(response) = self.interceptors.offer(request, busy, self, registry)? {
            return Ok((!response.is_empty()).then_some(response));
        }

        if busy {
            let sid = request.service_id()?;
            debug!(
                ecu = %self.name(),
                sid = format!("0x{:02X}", sid),
                "ECU busy, rejecting request"
            );
            return Ok(Some(negative_response(
                sid,
                NegativeResponseCode::BusyRepeatRequest,
            )));
        }

        registry.dispatch(request, self)
    }

    /// [`handle_request`](Self::handle_request) with failures logged and
    /// turned into silence, so one broken handler cannot take the
    /// simulation down
    pub fn process(&self, request: &DiagRequest) -> Option<Vec<u8>> {
        debug!(ecu = %self.name(), request = %request.hex(), "Received request");
        match self.handle_request(request) {
            Ok(Some(response)) => {
                debug!(ecu = %self.name(), response = %to_hex_upper(&response), "Sending response");
                Some(response)
            }
            Ok(None) => None,
            Err(e) => {
                error!(ecu = %self.name(), request = %request.hex(), error = %e, "Request handling failed");
                None
            }
        }
    }

    /// Return to the power-on state.
    ///
    /// Cancels timers, drops interceptors, clears ECU storage and the busy
    /// flag, then resets the registry (matcher storage, reset handlers).
    pub fn reset(&self) -> SimResult<()> {
        info!(ecu = %self.name(), "Resetting ECU");
        self.cancel_all_timers();
        self.interceptors.clear();
        self.data.storage().clear();
        self.busy.store(false, Ordering::SeqCst);
        self.data.registry().reset(self)
    }

    /// Names of the registered interceptors in the order they are tried
    pub fn interceptor_names(&self) -> Vec<String> {
        self.interceptors.names()
    }

    /// Names of timers that have neither fired nor been cancelled
    pub fn timer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.timers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn cancel_all_timers(&self) {
        let mut timers = self.timers.lock();
        for (name, entry) in timers.drain() {
            debug!(ecu = %self.name(), timer = %name, "Timer cancelled");
            entry.handle.abort();
        }
    }

    /// Take ownership of a due timer. Fails if the timer was cancelled or
    /// replaced in the meantime.
    fn claim_timer(&self, name: &str, id: u64) -> bool {
        let mut timers = self.timers.lock();
        match timers.get(name) {
            Some(entry) if entry.id == id => {
                timers.remove(name);
                true
            }
            _ => false,
        }
    }
}

impl EcuControl for SimEcu {
    fn name(&self) -> &str {
        self.data.name()
    }

    fn storage(&self) -> &KeyedStorage {
        self.data.storage()
    }

    fn add_or_replace_timer(&self, name: &str, delay: Duration, task: TimerTask) -> SimResult<()> {
        let runtime = Handle::try_current().map_err(|e| SimError::Runtime(e.to_string()))?;
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let ecu = self.self_ref.clone();
        let timer_name = name.to_string();

        let mut timers = self.timers.lock();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(ecu) = ecu.upgrade() else {
                return;
            };
            if !ecu.claim_timer(&timer_name, id) {
                return;
            }

            debug!(ecu = %ecu.name(), timer = %timer_name, "Timer fired");
            let control: &dyn EcuControl = &*ecu;
            if let Err(e) = task(control) {
                error!(ecu = %ecu.name(), timer = %timer_name, error = %e, "Timer task failed");
            }
        });

        debug!(ecu = %self.name(), timer = %name, ?delay, "Timer scheduled");
        if let Some(previous) = timers.insert(name.to_string(), TimerEntry { id, handle }) {
            debug!(ecu = %self.name(), timer = %name, "Replaced pending timer");
            previous.handle.abort();
        }
        Ok(())
    }

    fn cancel_timer(&self, name: &str) -> bool {
        match self.timers.lock().remove(name) {
            Some(entry) => {
                entry.handle.abort();
                debug!(ecu = %self.name(), timer = %name, "Timer cancelled");
                true
            }
            None => false,
        }
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
        if self.busy.swap(busy, Ordering::SeqCst) != busy {
            debug!(ecu = %self.name(), busy, "Busy state changed");
        }
    }

    fn send(&self, payload: Vec<u8>) {
        debug!(ecu = %self.name(), payload = %to_hex_upper(&payload), "Sending frame");
        let frame = OutboundFrame {
            ecu: self.name().to_string(),
            source_address: self.physical_address(),
            payload,
        };
        if self.outbound.send(frame).is_err() {
            warn!(ecu = %self.name(), "No transport attached, frame dropped");
        }
    }
}

impl Drop for SimEcu {
    fn drop(&mut self) {
        for (_, entry) in self.timers.get_mut().drain() {
            entry.handle.abort();
        }
    }
}

impl fmt::Debug for SimEcu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimEcu")
            .field("name", &self.name())
            .field("physical_address", &format_args!("0x{:04X}", self.physical_address()))
            .field("busy", &self.is_busy())
            .field("interceptors", &self.interceptors.names())
            .field("timers", &self.timer_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ecu_with(registry: RequestsData) -> Arc<SimEcu> {
        SimEcu::new(Arc::new(EcuData::new(registry, 0x0010, 0xDF00)))
    }

    #[test]
    fn dispatches_to_registry() {
        let registry = RequestsData::new("ENGINE");
        registry.request("10 []", |ctx| ctx.ack(&[0x00, 0x32, 0x01, 0xF4])).unwrap();
        let ecu = ecu_with(registry);

        assert_eq!(
            ecu.process(&DiagRequest::new(vec![0x10, 0x03])),
            Some(vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4])
        );
        assert_eq!(
            ecu.process(&DiagRequest::new(vec![0x22, 0xF1, 0x90])),
            Some(vec![0x7F, 0x22, 0x10])
        );
    }

    #[test]
    fn handler_failure_is_isolated() {
        let registry = RequestsData::new("ENGINE");
        registry.request("11 []", |ctx| ctx.ack_with(&[], 4)).unwrap();
        let ecu = ecu_with(registry);

        assert!(ecu.handle_request(&DiagRequest::new(vec![0x11, 0x01])).is_err());
        assert_eq!(ecu.process(&DiagRequest::new(vec![0x11, 0x01])), None);
        assert_eq!(ecu.process(&DiagRequest::new(vec![])), None);
    }

    #[test]
    fn busy_ecu_rejects_without_matching() {
        let registry = RequestsData::new("ENGINE");
        registry.request("3E 00", |ctx| ctx.ack(&[])).unwrap();
        let ecu = ecu_with(registry);

        ecu.set_busy(true);
        assert_eq!(
            ecu.process(&DiagRequest::new(vec![0x3E, 0x00])),
            Some(vec![0x7F, 0x3E, 0x21])
        );

        ecu.set_busy(false);
        assert_eq!(
            ecu.process(&DiagRequest::new(vec![0x3E, 0x00])),
            Some(vec![0x7E, 0x00])
        );
        assert_eq!(
            ecu.process(&DiagRequest::new(vec![0x3E, 0x00]).with_busy(true)),
            Some(vec![0x7F, 0x3E, 0x21])
        );
    }

    #[test]
    fn interceptor_runs_before_matchers() {
        let registry = RequestsData::new("ENGINE");
        registry.request("22 []", |ctx| ctx.ack(&[0x01])).unwrap();
        let ecu = ecu_with(registry);

        ecu.add_interceptor(
            Interceptor::new(|ctx| {
                if ctx.message().starts_with(&[0x22, 0xF1]) {
                    ctx.nrc(NegativeResponseCode::ConditionsNotCorrect)?;
                    return Ok(true);
                }
                Ok(false)
            })
            .with_name("block-f1"),
        );

        assert_eq!(
            ecu.process(&DiagRequest::new(vec![0x22, 0xF1, 0x90])),
            Some(vec![0x7F, 0x22, 0x22])
        );
        assert_eq!(
            ecu.process(&DiagRequest::new(vec![0x22, 0x01, 0x00])),
            Some(vec![0x62, 0x01, 0x01])
        );
        assert_eq!(ecu.interceptor_names(), vec!["block-f1".to_string()]);
    }

    #[test]
    fn continuing_interceptor_falls_through_to_matchers() {
        let registry = RequestsData::new("ENGINE");
        registry.request("22 []", |ctx| ctx.ack(&[0x01])).unwrap();
        let ecu = ecu_with(registry);

        ecu.add_interceptor(
            Interceptor::new(|ctx| {
                ctx.ecu().storage().set("last_did_read", ctx.message().to_vec());
                ctx.continue_matching(true);
                Ok(true)
            })
            .with_name("record-reads"),
        );

        assert_eq!(
            ecu.process(&DiagRequest::new(vec![0x22, 0xF1, 0x90])),
            Some(vec![0x62, 0xF1, 0x01])
        );
        let recorded: Vec<u8> = ecu.storage().get("last_did_read", Vec::new).unwrap();
        assert_eq!(recorded, vec![0x22, 0xF1, 0x90]);
    }

    #[test]
    fn interceptor_may_swallow_request() {
        let ecu = ecu_with(RequestsData::new("ENGINE"));
        ecu.add_interceptor(Interceptor::new(|_| Ok(true)));
        assert_eq!(ecu.process(&DiagRequest::new(vec![0x19, 0x02, 0xFF])), None);
    }

    #[test]
    fn timer_outside_runtime_fails() {
        let ecu = ecu_with(RequestsData::new("ENGINE"));
        let result = ecu.add_or_replace_timer(
            "late",
            Duration::from_millis(1),
            Box::new(|_: &dyn EcuControl| -> SimResult<()> { Ok(()) }),
        );
        assert!(matches!(result, Err(SimError::Runtime(_))));
        assert!(ecu.timer_names().is_empty());
    }

    #[test]
    fn send_without_subscriber_is_dropped() {
        let ecu = ecu_with(RequestsData::new("ENGINE"));
        ecu.send(vec![0x62, 0xF1, 0x90]);

        let mut rx = ecu.subscribe();
        ecu.send(vec![0x71, 0x01]);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.ecu, "ENGINE");
        assert_eq!(frame.source_address, 0x0010);
        assert_eq!(frame.payload, vec![0x71, 0x01]);
    }
}
