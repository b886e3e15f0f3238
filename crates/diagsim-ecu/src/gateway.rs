//! Runtime gateway
//!
//! A [`SimGateway`] is the running instance of one [`GatewayData`]: the
//! gateway's own diagnostic entity plus one [`SimEcu`] per ECU behind it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use diagsim_core::{DiagRequest, EcuControl, GatewayData, SimError, SimResult, TargetAddressType};
use tracing::{debug, info, warn};

use crate::ecu::{OutboundFrame, SimEcu};

/// Running instance of a configured gateway
pub struct SimGateway {
    data: Arc<GatewayData>,
    entity: Arc<SimEcu>,
    ecus: Vec<Arc<SimEcu>>,
    running: AtomicBool,
}

impl SimGateway {
    /// Create a stopped instance
    pub fn new(data: Arc<GatewayData>) -> Self {
        let entity = SimEcu::new(data.entity().clone());
        let ecus = data.ecus().iter().cloned().map(SimEcu::new).collect();
        Self {
            data,
            entity,
            ecus,
            running: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.data.name()
    }

    pub fn data(&self) -> &Arc<GatewayData> {
        &self.data
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(
                gateway = %self.name(),
                logical_address = format!("0x{:04X}", self.entity.physical_address()),
                ecus = self.ecus.len(),
                "Gateway started"
            );
        }
    }

    /// Stop accepting requests and cancel every pending timer
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            for ecu in self.all_ecus() {
                ecu.cancel_all_timers();
            }
            info!(gateway = %self.name(), "Gateway stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Reset the gateway entity and every ECU behind it.
    ///
    /// All entities are reset even if one fails; the first failure is
    /// returned.
    pub fn reset(&self) -> SimResult<()> {
        info!(gateway = %self.name(), "Resetting gateway");
        let mut first_error = None;
        for ecu in self.all_ecus() {
            if let Err(e) = ecu.reset() {
                warn!(gateway = %self.name(), ecu = %ecu.name(), error = %e, "ECU reset failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The gateway's own diagnostic entity
    pub fn entity(&self) -> &Arc<SimEcu> {
        &self.entity
    }

    /// ECUs behind the gateway
    pub fn ecus(&self) -> &[Arc<SimEcu>] {
        &self.ecus
    }

    /// Gateway entity followed by the ECUs behind it
    pub fn all_ecus(&self) -> impl Iterator<Item = &Arc<SimEcu>> {
        std::iter::once(&self.entity).chain(self.ecus.iter())
    }

    /// Entity (gateway or ECU) with the given name
    pub fn ecu(&self, name: &str) -> Option<&Arc<SimEcu>> {
        self.all_ecus().find(|ecu| ecu.name() == name)
    }

    /// Entity (gateway or ECU) with the given physical address
    pub fn ecu_by_address(&self, address: u16) -> Option<&Arc<SimEcu>> {
        self.all_ecus().find(|ecu| ecu.physical_address() == address)
    }

    /// Deliver `request` to the entities it addresses and collect their
    /// responses.
    ///
    /// Physical requests go to the entity with the matching physical
    /// address, functional requests to every entity listening on the
    /// target functional address.
    pub fn handle_request(&self, request: &DiagRequest) -> SimResult<Vec<OutboundFrame>> {
        if !self.is_running() {
            return Err(SimError::Runtime(format!(
                "gateway '{}' is not running",
                self.name()
            )));
        }

        let targets: Vec<&Arc<SimEcu>> = match request.target_type {
            TargetAddressType::Physical => self
                .ecu_by_address(request.target_address)
                .into_iter()
                .collect(),
            TargetAddressType::Functional => self
                .all_ecus()
                .filter(|ecu| ecu.functional_address() == request.target_address)
                .collect(),
        };

        if targets.is_empty() {
            debug!(
                gateway = %self.name(),
                target = format!("0x{:04X}", request.target_address),
                "No entity at target address"
            );
        }

        Ok(targets
            .into_iter()
            .filter_map(|ecu| {
                ecu.process(request).map(|payload| OutboundFrame {
                    ecu: ecu.name().to_string(),
                    source_address: ecu.physical_address(),
                    payload,
                })
            })
            .collect())
    }
}

impl Drop for SimGateway {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SimGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimGateway")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .field("entity", &self.entity)
            .field("ecus", &self.ecus)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagsim_core::{EcuData, RequestsData};
    use pretty_assertions::assert_eq;

    fn gateway() -> SimGateway {
        let gw = RequestsData::new("GW");
        gw.request("3E 00", |ctx| ctx.ack(&[])).unwrap();
        let engine = RequestsData::new("ENGINE");
        engine.request("22 F1 90", |ctx| ctx.respond_hex("62 F1 90 01")).unwrap();
        engine.request("3E 00", |ctx| ctx.ack(&[])).unwrap();
        let brakes = RequestsData::new("BRAKES").with_nrc_on_no_match(false);
        brakes.request("3E 00", |ctx| ctx.ack(&[])).unwrap();

        let data = GatewayData::new(EcuData::new(gw, 0x1010, 0xE400))
            .with_ecu(EcuData::new(engine, 0x1011, 0xE400))
            .with_ecu(EcuData::new(brakes, 0x1012, 0xE500));
        SimGateway::new(Arc::new(data))
    }

    #[test]
    fn lookups() {
        let gateway = gateway();
        assert_eq!(gateway.name(), "GW");
        assert_eq!(gateway.ecus().len(), 2);
        assert_eq!(gateway.ecu("BRAKES").unwrap().physical_address(), 0x1012);
        assert_eq!(gateway.ecu("GW").unwrap().physical_address(), 0x1010);
        assert_eq!(gateway.ecu_by_address(0x1011).unwrap().name(), "ENGINE");
        assert!(gateway.ecu_by_address(0x2000).is_none());
    }

    #[test]
    fn stopped_gateway_rejects_requests() {
        let gateway = gateway();
        let request = DiagRequest::new(vec![0x3E, 0x00]).with_addresses(0x0E00, 0x1011);
        assert!(matches!(gateway.handle_request(&request), Err(SimError::Runtime(_))));

        gateway.start();
        assert!(gateway.is_running());
        assert_eq!(gateway.handle_request(&request).unwrap().len(), 1);

        gateway.stop();
        assert!(!gateway.is_running());
    }

    #[test]
    fn physical_request_reaches_one_ecu() {
        let gateway = gateway();
        gateway.start();

        let request = DiagRequest::new(vec![0x22, 0xF1, 0x90]).with_addresses(0x0E00, 0x1011);
        let frames = gateway.handle_request(&request).unwrap();
        assert_eq!(
            frames,
            vec![OutboundFrame {
                ecu: "ENGINE".to_string(),
                source_address: 0x1011,
                payload: vec![0x62, 0xF1, 0x90, 0x01],
            }]
        );
    }

    #[test]
    fn functional_request_reaches_listeners() {
        let gateway = gateway();
        gateway.start();

        let request = DiagRequest::new(vec![0x3E, 0x00])
            .with_addresses(0x0E00, 0xE400)
            .functional();
        let responders: Vec<String> = gateway
            .handle_request(&request)
            .unwrap()
            .into_iter()
            .map(|frame| frame.ecu)
            .collect();
        assert_eq!(responders, vec!["GW".to_string(), "ENGINE".to_string()]);
    }

    #[test]
    fn silent_ecu_produces_no_frame() {
        let gateway = gateway();
        gateway.start();

        let request = DiagRequest::new(vec![0x19, 0x02]).with_addresses(0x0E00, 0x1012);
        assert!(gateway.handle_request(&request).unwrap().is_empty());
    }

    #[test]
    fn reset_clears_every_entity() {
        let gateway = gateway();
        gateway.data().storage().set("vin_written", true);
        gateway.ecu("ENGINE").unwrap().storage().set("session", 0x03u8);
        gateway.ecu("BRAKES").unwrap().set_busy(true);

        gateway.reset().unwrap();

        assert!(gateway.data().storage().is_empty());
        assert!(gateway.ecu("ENGINE").unwrap().storage().is_empty());
        assert!(!gateway.ecu("BRAKES").unwrap().is_busy());
    }
}
