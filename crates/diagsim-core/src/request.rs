//! Decoded diagnostic request as handed over by the transport layer

use crate::error::{SimError, SimResult};
use crate::hex_util::to_hex_upper;

/// How a request was addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetAddressType {
    /// Sent to one ECU
    #[default]
    Physical,
    /// Broadcast to every ECU listening on the functional address
    Functional,
}

/// An inbound diagnostic request
///
/// The first payload byte is the service identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiagRequest {
    pub payload: Vec<u8>,
    pub source_address: u16,
    pub target_address: u16,
    pub target_type: TargetAddressType,
    /// Set by the transport when the receiving ECU is still busy with an
    /// earlier request
    pub busy: bool,
}

impl DiagRequest {
    /// Create a physically addressed request with default addressing
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Set source and target addresses
    pub fn with_addresses(mut self, source_address: u16, target_address: u16) -> Self {
        self.source_address = source_address;
        self.target_address = target_address;
        self
    }

    /// Mark the request as functionally addressed
    pub fn functional(mut self) -> Self {
        self.target_type = TargetAddressType::Functional;
        self
    }

    /// Mark the request as arriving while the ECU is busy
    pub fn with_busy(mut self, busy: bool) -> Self {
        self.busy = busy;
        self
    }

    /// Service identifier (first payload byte)
    pub fn service_id(&self) -> SimResult<u8> {
        self.payload.first().copied().ok_or(SimError::EmptyRequest)
    }

    /// Payload byte at `index`
    pub fn byte(&self, index: usize) -> SimResult<u8> {
        self.payload
            .get(index)
            .copied()
            .ok_or(SimError::OutOfBounds {
                needed: index + 1,
                len: self.payload.len(),
            })
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload rendered as uppercase hex, for logging
    pub fn hex(&self) -> String {
        to_hex_upper(&self.payload)
    }
}
