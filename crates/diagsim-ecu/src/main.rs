//! Diagnostic ECU Simulator
//!
//! Loads gateways and ECUs from a config file and serves every entity that
//! has a `transport` section over its own ISO-TP socket.
//!
//! # Usage
//!
//! ```bash
//! ./diagsim-ecu --config config/simulator.toml
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use diagsim_core::{DiagRequest, EcuControl};
use diagsim_ecu::{SimEcu, Simulator, SimulatorConfig, TransportConfig};
use parking_lot::Mutex;
use socketcan::ExtendedId;
use socketcan_isotp::IsoTpSocket;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "diagsim-ecu")]
#[command(about = "Configurable diagnostic ECU simulator")]
struct Args {
    /// Configuration file path (TOML, or YAML with a .yaml/.yml extension)
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "diagsim_ecu=debug,diagsim_core=debug"
    } else {
        "diagsim_ecu=info,diagsim_core=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Loading config from: {}", args.config.display());
    let config = SimulatorConfig::load_any(&args.config)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    let simulator = Simulator::from_config(&config)?;
    simulator.start();

    let running = Arc::new(AtomicBool::new(true));
    let mut handles = Vec::new();
    for endpoint in endpoints(&simulator, &config)? {
        handles.extend(endpoint.spawn(running.clone())?);
    }

    if handles.is_empty() {
        warn!("No entity has a transport configured, nothing to serve");
    }

    info!("Simulator ready - waiting for requests");
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    running.store(false, Ordering::SeqCst);
    simulator.stop();

    for handle in handles {
        handle.abort();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    info!("Simulator stopped");
    Ok(())
}

/// Pair every entity that has a transport section with its running instance
fn endpoints(simulator: &Simulator, config: &SimulatorConfig) -> Result<Vec<IsoTpEndpoint>> {
    let mut endpoints = Vec::new();

    for gateway_config in &config.gateways {
        let gateway = simulator
            .gateway(&gateway_config.name)
            .ok_or_else(|| anyhow::anyhow!("Gateway '{}' not running", gateway_config.name))?;

        if let Some(transport) = &gateway_config.transport {
            endpoints.push(IsoTpEndpoint::new(transport, gateway.entity().clone())?);
        }

        for ecu_config in &gateway_config.ecus {
            let Some(transport) = &ecu_config.transport else {
                continue;
            };
            let ecu = gateway
                .ecu(&ecu_config.name)
                .ok_or_else(|| anyhow::anyhow!("ECU '{}' not running", ecu_config.name))?;
            endpoints.push(IsoTpEndpoint::new(transport, ecu.clone())?);
        }
    }

    Ok(endpoints)
}

/// One simulated entity served over an ISO-TP socket
struct IsoTpEndpoint {
    interface: String,
    rx_id: u32,
    tx_id: u32,
    /// Tester address derived from the receive CAN ID
    tester_address: u16,
    ecu: Arc<SimEcu>,
}

impl IsoTpEndpoint {
    fn new(transport: &TransportConfig, ecu: Arc<SimEcu>) -> Result<Self> {
        let rx_id = transport.rx_can_id()?;
        let tx_id = transport.tx_can_id()?;

        // Normal fixed addressing: 0x18DA<target><source>, the tester is the
        // source of what we receive
        let tester_address = (rx_id & 0xFF) as u16;

        Ok(Self {
            interface: transport.interface.clone(),
            rx_id,
            tx_id,
            tester_address,
            ecu,
        })
    }

    fn open(&self) -> Result<IsoTpSocket> {
        let rx_id = ExtendedId::new(self.rx_id)
            .ok_or_else(|| anyhow::anyhow!("Invalid extended CAN ID: 0x{:X}", self.rx_id))?;
        let tx_id = ExtendedId::new(self.tx_id)
            .ok_or_else(|| anyhow::anyhow!("Invalid extended CAN ID: 0x{:X}", self.tx_id))?;

        let socket = IsoTpSocket::open(&self.interface, rx_id, tx_id)
            .map_err(|e| anyhow::anyhow!("Failed to open ISO-TP socket: {}", e))?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Start the request loop and the forwarder for frames the ECU sends
    /// on its own (timers, delayed responses)
    fn spawn(self, running: Arc<AtomicBool>) -> Result<Vec<JoinHandle<()>>> {
        let socket = Arc::new(Mutex::new(self.open()?));

        info!(
            ecu = %self.ecu.name(),
            interface = %self.interface,
            rx_id = format!("0x{:08X}", self.rx_id),
            tx_id = format!("0x{:08X}", self.tx_id),
            "Serving ECU over ISO-TP"
        );

        let mut frames = self.ecu.subscribe();
        let socket_for_forwarder = socket.clone();
        let ecu_name = self.ecu.name().to_string();
        let forwarder = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        debug!(ecu = %frame.ecu, frame = ?frame.payload, "Sending unsolicited frame");
                        if let Err(e) = socket_for_forwarder.lock().write(&frame.payload) {
                            error!(?e, ecu = %frame.ecu, "Failed to send frame");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(ecu = %ecu_name, skipped, "Outbound frames dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let ecu = self.ecu;
        let target_address = ecu.physical_address();
        let tester_address = self.tester_address;
        let requests = tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                let received = socket.lock().read().map(|data| data.to_vec());

                match received {
                    Ok(data) if !data.is_empty() => {
                        let request = DiagRequest::new(data)
                            .with_addresses(tester_address, target_address);

                        if let Some(response) = ecu.process(&request) {
                            if let Err(e) = socket.lock().write(&response) {
                                error!(?e, ecu = %ecu.name(), "Failed to send response");
                            }
                        }
                    }
                    Ok(_) => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        error!(?e, ecu = %ecu.name(), "Socket read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        });

        Ok(vec![forwarder, requests])
    }
}
