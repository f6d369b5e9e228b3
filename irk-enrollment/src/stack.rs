//! BLE stack abstraction
//!
//! The enrollment logic only ever talks to the radio through [`BleStack`].
//! MCU-specific crates implement it over their BLE host (Bluedroid on ESP32);
//! [`crate::sim::SimulatedStack`] implements it in memory for tests.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{GapEvent, GattsEvent};
use crate::key::format_key;

/// GATT server interface handed out by the stack on app registration
pub type GattIf = u8;

/// Callback receiving GAP events
pub type GapCallback = Box<dyn FnMut(GapEvent) + Send + 'static>;

/// Callback receiving GATT server events with the interface they belong to
pub type GattsCallback = Box<dyn FnMut(GattIf, GattsEvent) + Send + 'static>;

/// Bluetooth device address, in the order the stack stores it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr(pub [u8; irk_proto::BD_ADDR_LEN]);

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// One bonded peer as reported by the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondRecord {
    pub addr: BdAddr,
    /// Peer IRK, little-endian as stored by the stack
    pub irk: [u8; irk_proto::IRK_LEN],
}

impl BondRecord {
    /// Display form of the peer IRK
    pub fn irk_hex(&self) -> String {
        format_key(&self.irk)
    }
}

/// Attribute UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtUuid {
    Uuid16(u16),
    Uuid32(u32),
    /// Little-endian, as stored by the stack
    Uuid128([u8; 16]),
}

impl BtUuid {
    /// The 16-bit form, if this UUID has one
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            BtUuid::Uuid16(u) => Some(*u),
            _ => None,
        }
    }
}

impl fmt::Display for BtUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BtUuid::Uuid16(u) => write!(f, "0x{u:04X}"),
            BtUuid::Uuid32(u) => write!(f, "0x{u:08X}"),
            BtUuid::Uuid128(bytes) => f.write_str(&format_key(bytes)),
        }
    }
}

/// Identifies a service being created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceId {
    pub uuid: BtUuid,
    pub inst_id: u8,
    pub is_primary: bool,
}

impl ServiceId {
    pub fn primary16(uuid: u16) -> Self {
        Self { uuid: BtUuid::Uuid16(uuid), inst_id: 0, is_primary: true }
    }
}

/// Attribute permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub read_encrypted: bool,
    pub write: bool,
}

impl Permissions {
    pub const READ: Permissions = Permissions { read: true, read_encrypted: false, write: false };
}

/// Characteristic properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Properties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

impl Properties {
    pub const READ: Properties = Properties { read: true, write: false, notify: false };
    pub const READ_NOTIFY: Properties = Properties { read: true, write: false, notify: true };
}

/// A characteristic with a static value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: BtUuid,
    pub permissions: Permissions,
    pub properties: Properties,
    pub value: Vec<u8>,
}

/// Authentication requirement for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthReq {
    /// Bonding only
    Bond,
    /// Bonding with MITM protection
    MitmBond,
    /// Secure connections with bonding
    ScBond,
    /// Secure connections, MITM protection and bonding
    ScMitmBond,
}

impl AuthReq {
    pub fn requires_mitm(&self) -> bool {
        matches!(self, AuthReq::MitmBond | AuthReq::ScMitmBond)
    }
}

/// Local I/O capability announced during pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoCap {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    /// No input, no output: "just works" pairing
    None,
    KeyboardDisplay,
}

/// Which key material is distributed during pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMask {
    /// Long term encryption key
    pub enc: bool,
    /// Identity key (IRK + identity address)
    pub id: bool,
}

impl KeyMask {
    pub const ENC_ID: KeyMask = KeyMask { enc: true, id: true };
}

/// A single security manager parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityParam {
    AuthReq(AuthReq),
    IoCap(IoCap),
    MaxKeySize(u8),
    InitKey(KeyMask),
    RspKey(KeyMask),
}

/// Link encryption level requested on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionLevel {
    Encrypt,
    EncryptNoMitm,
    EncryptMitm,
}

/// Advertising or scan response payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvData {
    /// true for the scan response payload
    pub set_scan_rsp: bool,
    pub include_name: bool,
    pub include_txpower: bool,
    /// Preferred connection interval hints (0 = omitted)
    pub min_interval: u16,
    pub max_interval: u16,
    /// GAP appearance (0 = omitted)
    pub appearance: u16,
    pub manufacturer_data: Vec<u8>,
    pub service_uuid: Option<[u8; 16]>,
    /// AD flags, 0 = omitted
    pub flag: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvType {
    /// Connectable undirected
    Ind,
    /// Non-connectable undirected
    NonConnInd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnAddrType {
    Public,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvFilterPolicy {
    AllowScanAnyConnAny,
    AllowScanWlstConnAny,
    AllowScanAnyConnWlst,
    AllowScanWlstConnWlst,
}

/// Advertising parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub adv_type: AdvType,
    pub own_addr_type: OwnAddrType,
    /// Bitmask of channels 37/38/39, 0x07 = all
    pub channel_map: u8,
    pub filter_policy: AdvFilterPolicy,
}

/// Trait for BLE host stack implementations
///
/// Every command either completes synchronously with an error, or completes
/// later through an event delivered to the registered callbacks. Commands must
/// not block waiting for that event.
pub trait BleStack {
    /// Error type for stack commands, displayed in logs
    type Error: fmt::Display;

    /// Register the GAP event callback
    fn register_gap_callback(&self, callback: GapCallback) -> Result<(), Self::Error>;

    /// Register the GATT server event callback
    fn register_gatts_callback(&self, callback: GattsCallback) -> Result<(), Self::Error>;

    /// Register a GATT server application; completes with `GattsEvent::AppRegistered`
    fn register_app(&self, app_id: u16) -> Result<(), Self::Error>;

    /// Set one security manager parameter
    fn set_security_param(&self, param: SecurityParam) -> Result<(), Self::Error>;

    /// Create a service; completes with `GattsEvent::ServiceCreated`
    fn create_service(&self, gatts_if: GattIf, service: &ServiceId, num_handles: u16) -> Result<(), Self::Error>;

    /// Start a created service
    fn start_service(&self, service_handle: u16) -> Result<(), Self::Error>;

    /// Add a characteristic to a service
    fn add_characteristic(&self, service_handle: u16, characteristic: &Characteristic) -> Result<(), Self::Error>;

    /// Configure advertising (or scan response) payload
    fn config_adv_data(&self, data: &AdvData) -> Result<(), Self::Error>;

    /// Set the GAP device name
    fn set_device_name(&self, name: &str) -> Result<(), Self::Error>;

    /// Start advertising
    fn start_advertising(&self, params: &AdvParams) -> Result<(), Self::Error>;

    /// Answer a peer's security request
    fn security_response(&self, addr: BdAddr, accept: bool) -> Result<(), Self::Error>;

    /// Number of bonded devices
    fn bond_device_count(&self) -> Result<usize, Self::Error>;

    /// All bonded devices with their key material
    fn bond_device_list(&self) -> Result<Vec<BondRecord>, Self::Error>;

    /// Disconnect a peer
    fn disconnect(&self, addr: BdAddr) -> Result<(), Self::Error>;

    /// Remove a bond and its keys
    fn remove_bond(&self, addr: BdAddr) -> Result<(), Self::Error>;

    /// Request link encryption with a connected peer
    fn set_encryption(&self, addr: BdAddr, level: EncryptionLevel) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bd_addr_display() {
        let addr = BdAddr([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(addr.to_string(), "aa:bb:cc:01:02:03");
    }

    #[test]
    fn uuid_display() {
        assert_eq!(BtUuid::Uuid16(0x180A).to_string(), "0x180A");
        assert_eq!(BtUuid::Uuid16(0x180D).as_u16(), Some(0x180D));
        assert_eq!(BtUuid::Uuid128([0; 16]).as_u16(), None);
    }

    #[test]
    fn mitm() {
        assert!(AuthReq::ScMitmBond.requires_mitm());
        assert!(!AuthReq::Bond.requires_mitm());
    }
}
