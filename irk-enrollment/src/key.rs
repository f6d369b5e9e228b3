//! Key formatting
//!
//! The stack stores keys little-endian. Everyone else (phones, Home Assistant's
//! private BLE device integration, Bluetooth Core sample data) writes them
//! most-significant byte first, so the display form reverses the buffer.

use data_encoding::HEXLOWER;

/// Format a key as lowercase hex, most-significant (last stored) byte first
pub fn format_key(key: &[u8]) -> String {
    let reversed: Vec<u8> = key.iter().rev().copied().collect();
    HEXLOWER.encode(&reversed)
}

/// Format a 16-byte IRK; always 32 characters
pub fn format_irk(irk: &[u8; irk_proto::IRK_LEN]) -> String {
    format_key(irk)
}
