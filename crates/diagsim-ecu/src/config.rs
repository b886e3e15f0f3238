//! Simulator configuration
//!
//! Declarative description of gateways, their ECUs and static request
//! rules. Closures registered through the `diagsim-core` API remain the
//! primary way to script behavior; static rules cover fixed answers.

use std::collections::BTreeMap;
use std::path::Path;

use diagsim_core::{
    parse_hex, EcuData, GatewayData, NegativeResponseCode, RequestMatcher, RequestsData,
    DEFAULT_REGEX_MATCH_BYTES,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::simulator::Simulator;

/// Complete simulator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
}

impl SimulatorConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from a YAML file
    pub fn load_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Load TOML or YAML depending on the file extension
    pub fn load_any(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::load_yaml(path),
            _ => Self::load(path),
        }
    }

    /// Build a simulator holding every configured gateway
    pub fn build(&self) -> ConfigResult<Simulator> {
        let simulator = Simulator::new();
        for gateway in &self.gateways {
            simulator.add_gateway(gateway.build()?)?;
        }
        Ok(simulator)
    }
}

impl Simulator {
    /// Build a simulator from configuration, see [`SimulatorConfig::build`]
    pub fn from_config(config: &SimulatorConfig) -> ConfigResult<Self> {
        config.build()
    }
}

// =============================================================================
// Gateway / ECU Configuration
// =============================================================================

/// A gateway and the ECUs behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub name: String,

    /// Logical address of the gateway's own diagnostic entity
    #[serde(deserialize_with = "deserialize_hex_u16")]
    pub logical_address: u16,

    #[serde(
        default = "default_functional_address",
        deserialize_with = "deserialize_hex_u16"
    )]
    pub functional_address: u16,

    /// Requests answered by the gateway itself
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub transport: Option<TransportConfig>,

    #[serde(default)]
    pub ecus: Vec<EcuConfig>,
}

impl GatewayConfig {
    pub fn build(&self) -> ConfigResult<GatewayData> {
        let entity = EcuData::new(
            self.registry.build(&self.name)?,
            self.logical_address,
            self.functional_address,
        );
        self.ecus
            .iter()
            .try_fold(GatewayData::new(entity), |gateway, ecu| {
                Ok(gateway.with_ecu(ecu.build()?))
            })
    }
}

/// A simulated ECU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuConfig {
    pub name: String,

    #[serde(deserialize_with = "deserialize_hex_u16")]
    pub physical_address: u16,

    #[serde(
        default = "default_functional_address",
        deserialize_with = "deserialize_hex_u16"
    )]
    pub functional_address: u16,

    #[serde(default)]
    pub registry: RegistryConfig,

    /// ISO-TP endpoint; ECUs without one are only reachable in-process
    #[serde(default)]
    pub transport: Option<TransportConfig>,
}

impl EcuConfig {
    pub fn build(&self) -> ConfigResult<EcuData> {
        Ok(EcuData::new(
            self.registry.build(&self.name)?,
            self.physical_address,
            self.functional_address,
        ))
    }
}

fn default_functional_address() -> u16 {
    0xE400
}

// =============================================================================
// Registry Configuration
// =============================================================================

/// Matching defaults and static request rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Answer unmatched requests with GeneralReject
    #[serde(default = "default_nrc_on_no_match")]
    pub nrc_on_no_match: bool,

    /// Leading request bytes considered for regex matching
    #[serde(default = "default_request_regex_match_bytes")]
    pub request_regex_match_bytes: usize,

    /// Service id (e.g. "0x22") to number of request bytes echoed by `ack`
    #[serde(default)]
    pub ack_bytes_lengths: BTreeMap<String, usize>,

    #[serde(default)]
    pub requests: Vec<StaticRequest>,
}

fn default_nrc_on_no_match() -> bool {
    true
}

fn default_request_regex_match_bytes() -> usize {
    DEFAULT_REGEX_MATCH_BYTES
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            nrc_on_no_match: default_nrc_on_no_match(),
            request_regex_match_bytes: default_request_regex_match_bytes(),
            ack_bytes_lengths: BTreeMap::new(),
            requests: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Build the registry of entity `name`
    pub fn build(&self, name: &str) -> ConfigResult<RequestsData> {
        let ack_bytes_lengths = self
            .ack_bytes_lengths
            .iter()
            .map(|(sid, bytes)| {
                parse_hex_u8(sid)
                    .map(|sid| (sid, *bytes))
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!("{name}: invalid service id '{sid}'"))
                    })
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        let registry = RequestsData::new(name)
            .with_nrc_on_no_match(self.nrc_on_no_match)
            .with_request_regex_match_bytes(self.request_regex_match_bytes)
            .with_ack_bytes_lengths(ack_bytes_lengths);

        for request in &self.requests {
            registry.add_request(request.to_matcher()?);
        }
        Ok(registry)
    }
}

/// A request answered with a fixed payload or negative response code
///
/// `request` uses the string form: literal hex, or a template when it
/// contains `[`, `.` or `|`. Without `response` and `nrc` the request is
/// accepted silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRequest {
    #[serde(default)]
    pub name: Option<String>,

    pub request: String,

    /// Response payload as hex
    #[serde(default)]
    pub response: Option<String>,

    /// Negative response code
    #[serde(default, deserialize_with = "deserialize_optional_hex_u8")]
    pub nrc: Option<u8>,
}

impl StaticRequest {
    pub fn to_matcher(&self) -> ConfigResult<RequestMatcher> {
        let matcher = match (&self.response, self.nrc) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(format!(
                    "request '{}' sets both response and nrc",
                    self.request
                )))
            }
            (Some(response), None) => {
                let payload = parse_hex(response)?;
                RequestMatcher::parse(&self.request, move |ctx| {
                    ctx.respond(payload.clone());
                    Ok(())
                })?
            }
            (None, Some(code)) => {
                let code = NegativeResponseCode::from(code);
                RequestMatcher::parse(&self.request, move |ctx| ctx.nrc(code))?
            }
            (None, None) => RequestMatcher::parse(&self.request, |_| Ok(()))?,
        };

        Ok(match &self.name {
            Some(name) => matcher.with_name(name.clone()),
            None => matcher,
        })
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// ISO-TP endpoint of one entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// CAN interface
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Entity's receive CAN ID (tester sends to this)
    pub rx_id: String,

    /// Entity's transmit CAN ID (entity sends from this)
    pub tx_id: String,
}

fn default_interface() -> String {
    "vcan0".to_string()
}

impl TransportConfig {
    pub fn rx_can_id(&self) -> ConfigResult<u32> {
        parse_can_id(&self.rx_id)
    }

    pub fn tx_can_id(&self) -> ConfigResult<u32> {
        parse_can_id(&self.tx_id)
    }
}

// =============================================================================
// Hex Parsing Helpers
// =============================================================================

fn strip_hex_prefix(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Parse a CAN ID (supports "0x18DA10F1" or "18DA10F1")
pub fn parse_can_id(s: &str) -> ConfigResult<u32> {
    u32::from_str_radix(strip_hex_prefix(s), 16)
        .map_err(|e| ConfigError::Invalid(format!("invalid CAN ID '{s}': {e}")))
}

fn parse_hex_u8(s: &str) -> Option<u8> {
    u8::from_str_radix(strip_hex_prefix(s), 16).ok()
}

/// Deserialize a hex u16 (supports "0x1010" or 4112)
fn deserialize_hex_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Hex(String),
        Int(u16),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Hex(s) => {
            u16::from_str_radix(strip_hex_prefix(&s), 16).map_err(|e| D::Error::custom(e.to_string()))
        }
    }
}

/// Deserialize an optional hex u8 (supports "0x31" or 49)
fn deserialize_optional_hex_u8<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Hex(String),
        Int(u8),
    }

    match Option::<HexOrInt>::deserialize(deserializer)? {
        None => Ok(None),
        Some(HexOrInt::Int(n)) => Ok(Some(n)),
        Some(HexOrInt::Hex(s)) => parse_hex_u8(&s)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid hex byte '{s}'"))),
    }
}
