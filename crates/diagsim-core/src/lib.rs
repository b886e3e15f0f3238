//! diagsim-core - Request matching and response orchestration for simulated ECUs
//!
//! Test engineers describe, per simulated ECU, which requests it recognizes
//! and how it answers them. This crate holds that description and decides,
//! for one decoded request, which bytes go back on the wire.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          EcuData                             │
//! │  physical / functional address, ECU-level KeyedStorage       │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                    RequestsData                        │  │
//! │  │  nrc_on_no_match, regex match bytes, ack lengths       │  │
//! │  │  ┌────────────────┐ ┌────────────────┐ ┌────────────┐  │  │
//! │  │  │RequestMatcher 1│ │RequestMatcher 2│ │ResetHandler│  │  │
//! │  │  │bytes | regex   │ │bytes | regex   │ │    ...     │  │  │
//! │  │  └───────┬────────┘ └────────────────┘ └────────────┘  │  │
//! │  └──────────┼─────────────────────────────────────────────┘  │
//! └─────────────┼────────────────────────────────────────────────┘
//!               │ match
//!        ┌──────┴──────────┐      ┌──────────────────────┐
//!        │ ResponseContext │─────▶│ EcuControl (runtime) │
//!        │ respond/ack/nrc │      │ timers, interceptors │
//!        └─────────────────┘      └──────────────────────┘
//! ```
//!
//! A running ECU (see the `diagsim-ecu` crate) offers each request to its
//! [`InterceptorSet`] first and then to [`RequestsData::dispatch`].
//!
//! # Example
//!
//! ```ignore
//! use diagsim_core::{EcuData, NegativeResponseCode, RequestsData};
//!
//! let registry = RequestsData::new("ENGINE").with_ack_bytes_length(0x22, 3);
//! registry.request("10 []", |ctx| ctx.ack(&[0x00, 0x32, 0x01, 0xF4]))?;
//! registry.request("22 F1 90", |ctx| ctx.ack(b"WVWZZZ1JZXW000001"))?;
//! registry.request("27 []", |ctx| ctx.nrc(NegativeResponseCode::SecurityAccessDenied))?;
//! let ecu = EcuData::new(registry, 0x0010, 0xDF00);
//! ```

pub mod control;
pub mod error;
pub mod hex_util;
pub mod interceptor;
pub mod matcher;
pub mod registry;
pub mod request;
pub mod response;
pub mod storage;
pub mod uds;

#[cfg(test)]
mod test_support;

pub use control::{EcuControl, TimerTask};
pub use error::{SimError, SimResult};
pub use hex_util::{parse_hex, to_hex_upper};
pub use interceptor::{Interceptor, InterceptorHandler, InterceptorSet};
pub use matcher::{RequestMatcher, RequestPattern, ResponseHandler};
pub use registry::{
    EcuData, GatewayData, RequestsData, ResetHandler, ResetHandlerFn, DEFAULT_REGEX_MATCH_BYTES,
};
pub use request::{DiagRequest, TargetAddressType};
pub use response::{Caller, ResponseContext};
pub use storage::KeyedStorage;
pub use uds::NegativeResponseCode;
