//! Utility functions for minting identifiers

use super::error::PortalError;
use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String, PortalError> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| PortalError::Codec(e.to_string()))?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| PortalError::Codec(e.to_string()))?;
    Ok(encode)
}

/// Human readable order/service code from a monotonic counter, e.g. `PRD-0042`.
pub fn sequence_code(prefix: &str, n: u64) -> String {
    format!("{prefix}-{n:04}")
}
