//! diagsim-ecu - Runtime for simulated diagnostic ECUs
//!
//! Turns the definitions of `diagsim-core` into running entities.
//!
//! # Modules
//!
//! - [`ecu`] - Per-ECU dispatch, timers, interceptors and busy state
//! - [`gateway`] - Running gateway with the ECUs behind it
//! - [`simulator`] - Process-scoped registry with start/stop/reset
//! - [`config`] - TOML/YAML configuration of gateways, ECUs and static requests

pub mod config;
pub mod ecu;
pub mod error;
pub mod gateway;
pub mod simulator;

pub use config::{
    EcuConfig, GatewayConfig, RegistryConfig, SimulatorConfig, StaticRequest, TransportConfig,
};
pub use ecu::{OutboundFrame, SimEcu};
pub use error::{ConfigError, ConfigResult};
pub use gateway::SimGateway;
pub use simulator::Simulator;
