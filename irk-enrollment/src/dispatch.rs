//! Event dispatcher
//!
//! Single entry point for stack callbacks. GATT lifecycle events are turned
//! into [`BuildInput`]s for the builder; everything else is handled here.

use log::*;

use crate::component::Enrollment;
use crate::event::{GapEvent, GattsEvent};
use crate::gatt::{BuildInput, Transition};
use crate::stack::{BleStack, GattIf};

/// Builder input carried by a GATTS event, if any
pub fn build_input(gatts_if: GattIf, event: &GattsEvent) -> Option<BuildInput> {
    match event {
        GattsEvent::AppRegistered { status, .. } => Some(BuildInput::AppRegistered { status: *status, gatts_if }),
        GattsEvent::ServiceCreated { status, service_handle, service_id } => Some(BuildInput::ServiceCreated {
            status: *status,
            service_handle: *service_handle,
            uuid: service_id.uuid,
        }),
        _ => None,
    }
}

impl<S: BleStack> Enrollment<S> {
    pub(crate) fn handle_gap_event(&mut self, event: GapEvent) {
        match event {
            GapEvent::AdvDataSetComplete { status } => {
                info!("Advertising data set complete ({})", status);
            }
            GapEvent::ScanRspDataSetComplete { status } => {
                info!("Scan response data set complete ({})", status);
            }
            GapEvent::AdvStartComplete { status } => {
                if status.is_ok() {
                    info!("Advertising start complete");
                } else {
                    error!("Advertising start failed: {}", status);
                }
            }
            GapEvent::KeyExchange { key_type } => {
                info!("BLE key exchange event (key type 0x{:02x})", key_type);
            }
            GapEvent::SecurityRequest { addr } => {
                info!("BLE security request from {} - responding with accept", addr);
                if let Err(e) = self.stack.security_response(addr, true) {
                    error!("Failed to accept security request from {}: {}", addr, e);
                }
            }
            GapEvent::AuthComplete { addr, success, fail_reason } => {
                info!("BLE authentication complete with {} - success: {}", addr, success);
                if !success {
                    debug!("Authentication failure reason: 0x{:02x}", fail_reason);
                }
            }
            GapEvent::Other(code) => debug!("Unhandled GAP event: {}", code),
        }
    }

    pub(crate) fn handle_gatts_event(&mut self, gatts_if: GattIf, event: GattsEvent) {
        debug!("GATTS event received: {:?}, gatts_if: {}", event, gatts_if);

        if let Some(input) = build_input(gatts_if, &event) {
            if self.builder.on_input(&self.stack, input) == Transition::BecameReady {
                info!("GATT services ready, starting advertising");
                self.start_advertising();
            }
            return;
        }

        match event {
            GattsEvent::ServiceStarted { status, service_handle } => {
                if status.is_ok() {
                    debug!("Service {} started", service_handle);
                } else {
                    warn!("Service {} failed to start: {}", service_handle, status);
                }
            }
            GattsEvent::CharacteristicAdded { status, service_handle, attr_handle, uuid } => {
                if status.is_ok() {
                    debug!("Characteristic {} added to service {} at handle {}", uuid, service_handle, attr_handle);
                } else {
                    warn!("Characteristic {} rejected by service {}: {}", uuid, service_handle, status);
                }
            }
            GattsEvent::PeerConnected { conn_id, addr } => {
                self.stats.connections += 1;
                info!("Peer {} connected (conn {}) - starting encryption", addr, conn_id);
                if let Err(e) = self.stack.set_encryption(addr, self.policy.encryption) {
                    error!("Failed to request encryption with {}: {}", addr, e);
                }
            }
            GattsEvent::PeerDisconnected { addr, reason, .. } => {
                if self.builder.is_ready() {
                    info!("Peer {} disconnected (reason 0x{:02x}) - restarting advertising", addr, reason);
                    self.start_advertising();
                } else {
                    info!("Peer {} disconnected before GATT bring-up finished", addr);
                }
            }
            GattsEvent::Other(code) => debug!("Unhandled GATTS event: {}", code),
            GattsEvent::AppRegistered { .. } | GattsEvent::ServiceCreated { .. } => {}
        }
    }

    fn start_advertising(&mut self) {
        if self.advertiser.start_or_restart(&self.stack) {
            self.stats.adv_starts += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Status;
    use crate::stack::{BtUuid, ServiceId};

    #[test]
    fn translates_lifecycle_events_only() {
        let created = GattsEvent::ServiceCreated {
            status: Status::Ok,
            service_handle: 40,
            service_id: ServiceId::primary16(0x180A),
        };
        assert_eq!(
            build_input(3, &created),
            Some(BuildInput::ServiceCreated { status: Status::Ok, service_handle: 40, uuid: BtUuid::Uuid16(0x180A) })
        );
        assert_eq!(
            build_input(3, &GattsEvent::AppRegistered { status: Status::Ok, app_id: 0 }),
            Some(BuildInput::AppRegistered { status: Status::Ok, gatts_if: 3 })
        );
        assert_eq!(build_input(3, &GattsEvent::Other(99)), None);
    }
}
