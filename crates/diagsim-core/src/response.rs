//! Execution context handed to response handlers and interceptors

use std::time::Duration;

use crate::control::EcuControl;
use crate::error::{SimError, SimResult};
use crate::hex_util::parse_hex;
use crate::interceptor::Interceptor;
use crate::matcher::RequestMatcher;
use crate::registry::RequestsData;
use crate::request::DiagRequest;
use crate::storage::KeyedStorage;
use crate::uds::{negative_response, positive_response, NegativeResponseCode};

/// What produced a [`ResponseContext`]
#[derive(Clone, Copy)]
pub enum Caller<'a> {
    /// A request matcher whose pattern matched
    Matcher(&'a RequestMatcher),
    /// An interceptor offered the request ahead of matching
    Interceptor(&'a Interceptor),
}

impl<'a> Caller<'a> {
    /// Name of the matcher or interceptor
    pub fn name(&self) -> Option<&'a str> {
        match self {
            Caller::Matcher(matcher) => matcher.name(),
            Caller::Interceptor(interceptor) => Some(interceptor.name()),
        }
    }

    /// Persistent storage of the matcher or interceptor
    pub fn storage(&self) -> &'a KeyedStorage {
        match self {
            Caller::Matcher(matcher) => matcher.storage(),
            Caller::Interceptor(interceptor) => interceptor.storage(),
        }
    }
}

/// Mutable state of one handler invocation
///
/// Every response operation overwrites the pending response; the last write
/// within one invocation wins. An empty response means "send nothing".
pub struct ResponseContext<'a> {
    caller: Caller<'a>,
    request: &'a DiagRequest,
    ecu: &'a dyn EcuControl,
    registry: &'a RequestsData,
    response: Vec<u8>,
    continue_matching: bool,
}

impl<'a> ResponseContext<'a> {
    pub fn new(
        caller: Caller<'a>,
        request: &'a DiagRequest,
        ecu: &'a dyn EcuControl,
        registry: &'a RequestsData,
    ) -> Self {
        Self {
            caller,
            request,
            ecu,
            registry,
            response: Vec::new(),
            continue_matching: false,
        }
    }

    pub fn caller(&self) -> Caller<'a> {
        self.caller
    }

    /// Storage of the matcher or interceptor handling this request
    pub fn storage(&self) -> &'a KeyedStorage {
        self.caller.storage()
    }

    pub fn request(&self) -> &'a DiagRequest {
        self.request
    }

    /// Raw request payload
    pub fn message(&self) -> &'a [u8] {
        &self.request.payload
    }

    /// The ECU dispatching this request
    pub fn ecu(&self) -> &'a dyn EcuControl {
        self.ecu
    }

    /// Pending response payload
    pub fn response(&self) -> &[u8] {
        &self.response
    }

    /// Send `payload` verbatim
    pub fn respond(&mut self, payload: impl Into<Vec<u8>>) {
        self.response = payload.into();
    }

    /// Send the bytes of a hex string verbatim
    pub fn respond_hex(&mut self, hex: &str) -> SimResult<()> {
        self.response = parse_hex(hex)?;
        Ok(())
    }

    /// Positive response echoing the number of request bytes configured for
    /// this service id (2 when the registry has no entry)
    pub fn ack(&mut self, payload: &[u8]) -> SimResult<()> {
        let sid = self.request.service_id()?;
        let nr_of_request_bytes = self.registry.ack_bytes_length(sid);
        self.ack_with(payload, nr_of_request_bytes)
    }

    /// Positive response `[sid + 0x40, request[1..n]] + payload`.
    /// `nr_of_request_bytes` counts the service id itself.
    pub fn ack_with(&mut self, payload: &[u8], nr_of_request_bytes: usize) -> SimResult<()> {
        let message = self.message();
        let sid = self.request.service_id()?;
        if nr_of_request_bytes > message.len() {
            return Err(SimError::OutOfBounds {
                needed: nr_of_request_bytes,
                len: message.len(),
            });
        }

        let echoed = &message[1..nr_of_request_bytes.max(1)];
        let mut data = Vec::with_capacity(echoed.len() + payload.len());
        data.extend_from_slice(echoed);
        data.extend_from_slice(payload);
        self.response = positive_response(sid, &data);
        Ok(())
    }

    /// Negative response `[0x7F, sid, code]`
    pub fn nrc(&mut self, code: NegativeResponseCode) -> SimResult<()> {
        let sid = self.request.service_id()?;
        self.response = negative_response(sid, code);
        Ok(())
    }

    /// Keep scanning later matchers after this handler returns
    pub fn continue_matching(&mut self, value: bool) {
        self.continue_matching = value;
    }

    pub fn is_continue_matching(&self) -> bool {
        self.continue_matching
    }

    /// Schedule a named one-shot timer on the owning ECU
    pub fn add_or_replace_timer<F>(&self, name: &str, delay: Duration, task: F) -> SimResult<()>
    where
        F: FnOnce(&dyn EcuControl) -> SimResult<()> + Send + 'static,
    {
        self.ecu.add_or_replace_timer(name, delay, Box::new(task))
    }

    pub fn cancel_timer(&self, name: &str) -> bool {
        self.ecu.cancel_timer(name)
    }

    /// Register an interceptor on the owning ECU
    pub fn add_interceptor(&self, interceptor: Interceptor) -> String {
        self.ecu.add_interceptor(interceptor)
    }

    pub fn remove_interceptor(&self, name: &str) -> bool {
        self.ecu.remove_interceptor(name)
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, bool) {
        (self.response, self.continue_matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubEcu;
    use pretty_assertions::assert_eq;

    fn with_context<R>(
        payload: &[u8],
        registry: &RequestsData,
        f: impl FnOnce(&mut ResponseContext<'_>) -> R,
    ) -> R {
        let ecu = StubEcu::new("ECU");
        let matcher = RequestMatcher::exact(payload.to_vec(), |_| Ok(()));
        let request = DiagRequest::new(payload.to_vec());
        let mut ctx = ResponseContext::new(Caller::Matcher(&matcher), &request, &ecu, registry);
        f(&mut ctx)
    }

    #[test]
    fn ack_with_two_bytes() {
        let registry = RequestsData::new("ECU");
        let response = with_context(&[0x10, 0x03], &registry, |ctx| {
            ctx.ack_with(&[0x00, 0x32, 0x01, 0xF4], 2).unwrap();
            ctx.response().to_vec()
        });
        assert_eq!(response, vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
    }

    #[test]
    fn ack_uses_registry_length() {
        let registry = RequestsData::new("ECU").with_ack_bytes_length(0x22, 3);
        let response = with_context(&[0x22, 0xF1, 0x90], &registry, |ctx| {
            ctx.ack(b"VIN").unwrap();
            ctx.response().to_vec()
        });
        assert_eq!(response, vec![0x62, 0xF1, 0x90, b'V', b'I', b'N']);
    }

    #[test]
    fn ack_defaults_to_two_bytes() {
        let registry = RequestsData::new("ECU");
        let response = with_context(&[0x31, 0x01, 0xFF, 0x00], &registry, |ctx| {
            ctx.ack(&[]).unwrap();
            ctx.response().to_vec()
        });
        assert_eq!(response, vec![0x71, 0x01]);
    }

    #[test]
    fn ack_wraps_service_id() {
        let registry = RequestsData::new("ECU");
        let response = with_context(&[0xC5, 0x01], &registry, |ctx| {
            ctx.ack(&[]).unwrap();
            ctx.response().to_vec()
        });
        assert_eq!(response, vec![0x05, 0x01]);
    }

    #[test]
    fn ack_past_request_length_fails() {
        let registry = RequestsData::new("ECU");
        let result = with_context(&[0x3E], &registry, |ctx| ctx.ack(&[]));
        assert!(matches!(
            result,
            Err(SimError::OutOfBounds { needed: 2, len: 1 })
        ));
    }

    #[test]
    fn nrc_frame() {
        let registry = RequestsData::new("ECU");
        let response = with_context(&[0x22, 0x12, 0x34], &registry, |ctx| {
            ctx.nrc(NegativeResponseCode::RequestOutOfRange).unwrap();
            ctx.response().to_vec()
        });
        assert_eq!(response, vec![0x7F, 0x22, 0x31]);
    }

    #[test]
    fn last_write_wins() {
        let registry = RequestsData::new("ECU");
        let response = with_context(&[0x22, 0x12, 0x34], &registry, |ctx| {
            ctx.nrc(NegativeResponseCode::GeneralReject).unwrap();
            ctx.respond_hex("62 12 34 AA").unwrap();
            ctx.response().to_vec()
        });
        assert_eq!(response, vec![0x62, 0x12, 0x34, 0xAA]);
    }

    #[test]
    fn defaults_are_empty_and_stop_matching() {
        let registry = RequestsData::new("ECU");
        with_context(&[0x10, 0x01], &registry, |ctx| {
            assert!(ctx.response().is_empty());
            assert!(!ctx.is_continue_matching());
            ctx.continue_matching(true);
            assert!(ctx.is_continue_matching());
        });
    }

    #[test]
    fn timers_and_interceptors_reach_the_ecu() {
        let registry = RequestsData::new("ECU");
        let ecu = StubEcu::new("ECU");
        let matcher = RequestMatcher::exact(vec![0x10, 0x02], |_| Ok(()));
        let request = DiagRequest::new(vec![0x10, 0x02]);
        let ctx = ResponseContext::new(Caller::Matcher(&matcher), &request, &ecu, &registry);

        ctx.add_or_replace_timer("reset", Duration::from_millis(50), |_| Ok(()))
            .unwrap();
        let name = ctx.add_interceptor(Interceptor::new(|_| Ok(true)).with_name("block"));

        assert_eq!(name, "block");
        assert_eq!(ecu.timer_names(), vec!["reset".to_string()]);
        assert!(ctx.cancel_timer("reset"));
        assert!(ctx.remove_interceptor("block"));
        assert!(!ctx.remove_interceptor("block"));
    }

    #[test]
    fn pending_response_is_sent_by_timer() {
        let registry = RequestsData::new("ECU");
        let ecu = StubEcu::new("ECU");
        let matcher = RequestMatcher::exact(vec![0x31, 0x01, 0xFF, 0x00], |_| Ok(()));
        let request = DiagRequest::new(vec![0x31, 0x01, 0xFF, 0x00]);
        let mut ctx = ResponseContext::new(Caller::Matcher(&matcher), &request, &ecu, &registry);

        ctx.nrc(NegativeResponseCode::RequestCorrectlyReceivedButResponseIsPending)
            .unwrap();
        ctx.add_or_replace_timer("erase", Duration::from_millis(100), |ecu| {
            ecu.send(vec![0x71, 0x01, 0xFF, 0x00]);
            Ok(())
        })
        .unwrap();
        assert_eq!(ctx.response(), &[0x7F, 0x31, 0x78]);
        assert!(ecu.sent().is_empty());

        assert!(ecu.fire_timer("erase").unwrap());
        assert!(!ecu.fire_timer("erase").unwrap());
        assert_eq!(ecu.sent(), vec![vec![0x71, 0x01, 0xFF, 0x00]]);
    }

    #[test]
    fn caller_identifies_matcher_or_interceptor() {
        let registry = RequestsData::new("ECU");
        let ecu = StubEcu::new("ECU");
        let request = DiagRequest::new(vec![0x27, 0x01]);

        let unnamed = RequestMatcher::exact(vec![0x27, 0x01], |_| Ok(()));
        let ctx = ResponseContext::new(Caller::Matcher(&unnamed), &request, &ecu, &registry);
        assert_eq!(ctx.caller().name(), None);

        let interceptor = Interceptor::new(|_| Ok(false)).with_name("seed-spy");
        let ctx = ResponseContext::new(Caller::Interceptor(&interceptor), &request, &ecu, &registry);
        assert_eq!(ctx.caller().name(), Some("seed-spy"));
        assert!(matches!(ctx.caller(), Caller::Interceptor(_)));
    }
}
