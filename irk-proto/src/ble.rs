//! Advertising constants for the IRK collector
//!
//! Intervals are in the stack's native 0.625 ms units.

use crate::{uuid16_to_128, HEART_RATE_SERVICE};

/// Advertised 128-bit service UUID: Heart Rate on the base UUID.
/// Phones list heart rate sensors readily, which gets us a pairing prompt.
pub const ADV_SERVICE_UUID128: [u8; 16] = uuid16_to_128(HEART_RATE_SERVICE);

/// Appearance: Heart Rate Sensor (generic)
pub const ADV_APPEARANCE: u16 = 0x0341;

/// Manufacturer data: 0xFFFF (no company, for testing) + two payload bytes
pub const ADV_MANUFACTURER_DATA: [u8; 4] = [0xFF, 0xFF, 0x01, 0x02];

/// Preferred slave connection interval range carried in the advertisement
pub const ADV_CONN_INTERVAL_MIN: u16 = 0x0006;
pub const ADV_CONN_INTERVAL_MAX: u16 = 0x0010;

/// Advertising interval range: 20 ms .. 40 ms
pub const ADV_INTERVAL_MIN: u16 = 0x20;
pub const ADV_INTERVAL_MAX: u16 = 0x40;

/// Lowest advertising interval the controller accepts for connectable adverts
pub const ADV_INTERVAL_FLOOR: u16 = 0x20;

/// Highest advertising interval the controller accepts (10.24 s)
pub const ADV_INTERVAL_CEILING: u16 = 0x4000;

/// Longest device name that still fits the scan response with TX power
pub const MAX_DEVICE_NAME_LEN: usize = 26;

/// Largest manufacturer payload one legacy advertising AD structure can carry
/// (31 bytes minus length and type). Fields that no longer fit the payload are
/// dropped by the stack, in the order it builds them.
pub const MAX_MANUFACTURER_DATA_LEN: usize = 29;

/// AD flags
pub mod flags {
    /// LE General Discoverable Mode
    pub const GEN_DISC: u8 = 0x02;

    /// BR/EDR Not Supported
    pub const BREDR_NOT_SPT: u8 = 0x04;
}
