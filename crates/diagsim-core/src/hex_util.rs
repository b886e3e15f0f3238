//! Hex string helpers
//!
//! Requests and responses are written by test engineers as hex strings
//! (`"22 F1 90"`, `"0x62F190"`). These helpers turn them into bytes and back.

use crate::error::{SimError, SimResult};

/// Parse a hex string into bytes.
///
/// Whitespace is ignored and an optional `0x`/`0X` prefix is accepted.
pub fn parse_hex(s: &str) -> SimResult<Vec<u8>> {
    let trimmed = s.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();

    ::hex::decode(&compact).map_err(|e| SimError::InvalidHex {
        input: s.to_string(),
        reason: e.to_string(),
    })
}

/// Render bytes as uppercase hex without separators (`[0x22, 0xf1]` -> `"22F1"`)
pub fn to_hex_upper(bytes: &[u8]) -> String {
    ::hex::encode_upper(bytes)
}
