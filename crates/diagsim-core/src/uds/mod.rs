//! UDS framing constants and helpers used when building responses

mod nrc;

pub use nrc::NegativeResponseCode;

/// Offset added to a service id to form its positive response id
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Number of request bytes echoed in an acknowledgement when a registry
/// has no explicit length for the service (service id + one byte)
pub const DEFAULT_ACK_BYTES: usize = 2;

/// Service id of a negative response frame
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Create a positive response for a service
pub fn positive_response(service_id: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    // Wraps within a byte for service ids above 0xBF
    response.push(service_id.wrapping_add(POSITIVE_RESPONSE_OFFSET));
    response.extend_from_slice(data);
    response
}

/// Create a negative response
pub fn negative_response(service_id: u8, nrc: NegativeResponseCode) -> Vec<u8> {
    vec![NEGATIVE_RESPONSE_SID, service_id, nrc.into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_response_adds_offset() {
        assert_eq!(positive_response(0x10, &[0x01]), vec![0x50, 0x01]);
    }

    #[test]
    fn positive_response_wraps() {
        assert_eq!(positive_response(0xC5, &[]), vec![0x05]);
    }

    #[test]
    fn negative_response_frame() {
        assert_eq!(
            negative_response(0x22, NegativeResponseCode::RequestOutOfRange),
            vec![0x7F, 0x22, 0x31]
        );
    }
}
