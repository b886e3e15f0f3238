//! Process-scoped registry of configured gateways and their running instances

use std::sync::Arc;

use diagsim_core::{GatewayData, SimError, SimResult};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::gateway::SimGateway;

/// Configured gateways plus the instances created by [`start`](Self::start)
///
/// Definitions outlive instances: stopping discards the instances, but
/// matcher and ECU storage stay with the definitions until reset.
#[derive(Debug, Default)]
pub struct Simulator {
    gateways: RwLock<Vec<Arc<GatewayData>>>,
    instances: RwLock<Vec<Arc<SimGateway>>>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway definition. Names must be unique.
    pub fn add_gateway(&self, gateway: GatewayData) -> SimResult<Arc<GatewayData>> {
        gateway.validate()?;

        let mut gateways = self.gateways.write();
        if gateways.iter().any(|existing| existing.name() == gateway.name()) {
            return Err(SimError::InvalidConfig(format!(
                "gateway '{}' is already configured",
                gateway.name()
            )));
        }

        info!(
            gateway = %gateway.name(),
            ecus = gateway.ecus().len(),
            "Gateway configured"
        );
        let gateway = Arc::new(gateway);
        gateways.push(gateway.clone());
        Ok(gateway)
    }

    /// Configured gateway definitions
    pub fn gateways(&self) -> Vec<Arc<GatewayData>> {
        self.gateways.read().clone()
    }

    /// Running gateway instances
    pub fn instances(&self) -> Vec<Arc<SimGateway>> {
        self.instances.read().clone()
    }

    /// Running instance of the named gateway
    pub fn gateway(&self, name: &str) -> Option<Arc<SimGateway>> {
        self.instances
            .read()
            .iter()
            .find(|instance| instance.name() == name)
            .cloned()
    }

    pub fn is_running(&self) -> bool {
        !self.instances.read().is_empty()
    }

    /// Create and start one instance per configured gateway. Instances of
    /// an earlier start are stopped first.
    pub fn start(&self) {
        let mut instances = self.instances.write();
        if !instances.is_empty() {
            warn!("Simulator already running, restarting");
            for instance in instances.drain(..) {
                instance.stop();
            }
        }

        for data in self.gateways() {
            let instance = Arc::new(SimGateway::new(data));
            instance.start();
            instances.push(instance);
        }
        info!(gateways = instances.len(), "Simulator started");
    }

    /// Stop and discard every instance
    pub fn stop(&self) {
        let stopped: Vec<Arc<SimGateway>> = self.instances.write().drain(..).collect();
        for instance in &stopped {
            instance.stop();
        }
        info!(gateways = stopped.len(), "Simulator stopped");
    }

    /// Reset every running instance without stopping it
    pub fn reset(&self) -> SimResult<()> {
        let mut first_error = None;
        for instance in self.instances() {
            if let Err(e) = instance.reset() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagsim_core::{EcuData, RequestsData};

    fn gateway(name: &str, address: u16) -> GatewayData {
        GatewayData::new(EcuData::new(RequestsData::new(name), address, 0xE400))
            .with_ecu(EcuData::new(RequestsData::new(format!("{name}-ECU")), address + 1, 0xE400))
    }

    #[test]
    fn duplicate_gateway_names_are_rejected() {
        let simulator = Simulator::new();
        simulator.add_gateway(gateway("GW1", 0x1000)).unwrap();
        assert!(matches!(
            simulator.add_gateway(gateway("GW1", 0x2000)),
            Err(SimError::InvalidConfig(_))
        ));
        assert_eq!(simulator.gateways().len(), 1);
    }

    #[test]
    fn invalid_gateway_is_rejected() {
        let simulator = Simulator::new();
        let data = GatewayData::new(EcuData::new(RequestsData::new("GW"), 0x1000, 0xE400))
            .with_ecu(EcuData::new(RequestsData::new("ECU"), 0x1000, 0xE400));
        assert!(simulator.add_gateway(data).is_err());
        assert!(simulator.gateways().is_empty());
    }

    #[test]
    fn start_stop_lifecycle() {
        let simulator = Simulator::new();
        simulator.add_gateway(gateway("GW1", 0x1000)).unwrap();
        simulator.add_gateway(gateway("GW2", 0x2000)).unwrap();
        assert!(!simulator.is_running());

        simulator.start();
        assert!(simulator.is_running());
        assert_eq!(simulator.instances().len(), 2);
        let gw1 = simulator.gateway("GW1").unwrap();
        assert!(gw1.is_running());

        simulator.stop();
        assert!(!simulator.is_running());
        assert!(!gw1.is_running());
        assert!(simulator.gateway("GW1").is_none());
        assert_eq!(simulator.gateways().len(), 2);
    }

    #[test]
    fn restart_replaces_instances() {
        let simulator = Simulator::new();
        simulator.add_gateway(gateway("GW1", 0x1000)).unwrap();

        simulator.start();
        let first = simulator.gateway("GW1").unwrap();
        simulator.start();
        let second = simulator.gateway("GW1").unwrap();

        assert!(!first.is_running());
        assert!(second.is_running());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(simulator.instances().len(), 1);
    }
}
