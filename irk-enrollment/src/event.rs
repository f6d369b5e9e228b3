//! Asynchronous events delivered by the BLE stack
//!
//! Only the kinds the enrollment flow reacts to get their own variant; anything
//! else arrives as `Other` with the stack's raw event code.

use crate::stack::{BdAddr, BtUuid, ServiceId};

/// Completion status carried by stack events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Stack specific failure code
    Failed(u16),
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => f.write_str("ok"),
            Status::Failed(code) => write!(f, "failed (0x{code:02x})"),
        }
    }
}

/// GAP events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapEvent {
    AdvDataSetComplete { status: Status },
    ScanRspDataSetComplete { status: Status },
    AdvStartComplete { status: Status },
    /// Key material exchanged during pairing
    KeyExchange { key_type: u8 },
    /// Peer asks us to start security
    SecurityRequest { addr: BdAddr },
    AuthComplete { addr: BdAddr, success: bool, fail_reason: u8 },
    Other(u32),
}

/// GATT server events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattsEvent {
    AppRegistered { status: Status, app_id: u16 },
    ServiceCreated { status: Status, service_handle: u16, service_id: ServiceId },
    ServiceStarted { status: Status, service_handle: u16 },
    CharacteristicAdded { status: Status, service_handle: u16, attr_handle: u16, uuid: BtUuid },
    PeerConnected { conn_id: u16, addr: BdAddr },
    PeerDisconnected { conn_id: u16, addr: BdAddr, reason: u16 },
    Other(u32),
}
