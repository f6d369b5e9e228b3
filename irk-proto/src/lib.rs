//! IRK harvest protocol constants - GATT services, characteristics and UUIDs
//!
//! Everything here is plain data. The core crate (`irk-enrollment`) and the
//! firmware crate build their stack commands out of these values.

pub mod ble;

/// Length of an Identity Resolving Key in bytes
pub const IRK_LEN: usize = 16;

/// Length of a Bluetooth device address in bytes
pub const BD_ADDR_LEN: usize = 6;

/// Maximum encryption key size the policy may request
pub const MAX_KEY_SIZE: u8 = 16;

/// Minimum encryption key size the Bluetooth core spec allows
pub const MIN_KEY_SIZE: u8 = 7;

// Service UUIDs (16-bit, assigned numbers)
pub const DEVICE_INFORMATION_SERVICE: u16 = 0x180A;
pub const HEART_RATE_SERVICE: u16 = 0x180D;

// Characteristic UUIDs
pub const MANUFACTURER_NAME_CHAR: u16 = 0x2A29;
pub const MODEL_NUMBER_CHAR: u16 = 0x2A24;
pub const HEART_RATE_MEASUREMENT_CHAR: u16 = 0x2A37;

/// Attribute handles reserved per created service
pub const SERVICE_NUM_HANDLES: u16 = 10;

/// GATT application id registered with the stack
pub const DEFAULT_APP_ID: u16 = 0;

/// Heart Rate Measurement value: flags (sensor contact supported+detected), 64 bpm
pub const HEART_RATE_MEASUREMENT_VALUE: [u8; 2] = [0x06, 0x40];

/// Default Manufacturer Name string
pub const DEFAULT_MANUFACTURER: &str = "IRK Harvest";

/// Default Model Number string
pub const DEFAULT_MODEL: &str = "IRK Collector";

/// Default advertised device name
pub const DEFAULT_DEVICE_NAME: &str = "IRK Collector";

/// Bluetooth base UUID 00000000-0000-1000-8000-00805F9B34FB, little-endian
pub const BASE_UUID_LE: [u8; 16] = [
    0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80,
    0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Expand a 16-bit UUID onto the Bluetooth base UUID (little-endian byte order,
/// as the stack stores 128-bit UUIDs)
pub const fn uuid16_to_128(uuid: u16) -> [u8; 16] {
    let mut out = BASE_UUID_LE;
    let bytes = uuid.to_le_bytes();
    out[12] = bytes[0];
    out[13] = bytes[1];
    out
}

/// Human readable name of a known 16-bit service or characteristic UUID
pub fn uuid16_name(uuid: u16) -> Option<&'static str> {
    match uuid {
        DEVICE_INFORMATION_SERVICE => Some("Device Information"),
        HEART_RATE_SERVICE => Some("Heart Rate"),
        MANUFACTURER_NAME_CHAR => Some("Manufacturer Name"),
        MODEL_NUMBER_CHAR => Some("Model Number"),
        HEART_RATE_MEASUREMENT_CHAR => Some("Heart Rate Measurement"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heart_rate_expands_to_base_uuid() {
        assert_eq!(
            uuid16_to_128(HEART_RATE_SERVICE),
            [
                0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80,
                0x00, 0x10, 0x00, 0x00, 0x0D, 0x18, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn names() {
        assert_eq!(uuid16_name(0x180A), Some("Device Information"));
        assert_eq!(uuid16_name(0x1234), None);
    }
}
