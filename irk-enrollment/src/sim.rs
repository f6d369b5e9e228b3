//! In-memory BLE stack
//!
//! Records every command, keeps a bond table, and answers commands the way
//! Bluedroid does: with a completion event queued for later delivery. Nothing is
//! delivered until [`SimulatedStack::run_until_idle`] is called, so callbacks
//! never run re-entrantly inside a command.
//!
//! The handle is cheap to clone; clones share one simulated controller.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::*;

use crate::event::{GapEvent, GattsEvent, Status};
use crate::stack::{
    AdvData, AdvParams, BdAddr, BleStack, BondRecord, BtUuid, Characteristic, EncryptionLevel,
    GapCallback, GattIf, GattsCallback, SecurityParam, ServiceId,
};

/// Interface number handed out on app registration
pub const SIM_GATTS_IF: GattIf = 3;

/// First service handle handed out
const FIRST_SERVICE_HANDLE: u16 = 40;

/// HCI reason "connection terminated by local host"
const REASON_LOCAL_HOST: u16 = 0x16;

/// HCI reason "remote user terminated connection"
const REASON_REMOTE_USER: u16 = 0x13;

/// GATT status the simulator reports for a forced service failure
const GATT_ERROR: u16 = 0x85;

/// A command the enrollment logic issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RegisterGapCallback,
    RegisterGattsCallback,
    RegisterApp(u16),
    SetSecurityParam(SecurityParam),
    CreateService { gatts_if: GattIf, service: ServiceId, num_handles: u16 },
    StartService(u16),
    AddCharacteristic { service_handle: u16, characteristic: Characteristic },
    ConfigAdvData(AdvData),
    SetDeviceName(String),
    StartAdvertising(AdvParams),
    SecurityResponse { addr: BdAddr, accept: bool },
    BondDeviceCount,
    BondDeviceList,
    Disconnect(BdAddr),
    RemoveBond(BdAddr),
    SetEncryption { addr: BdAddr, level: EncryptionLevel },
}

impl Command {
    /// Method name on [`BleStack`], used to inject failures
    pub fn name(&self) -> &'static str {
        match self {
            Command::RegisterGapCallback => "register_gap_callback",
            Command::RegisterGattsCallback => "register_gatts_callback",
            Command::RegisterApp(_) => "register_app",
            Command::SetSecurityParam(_) => "set_security_param",
            Command::CreateService { .. } => "create_service",
            Command::StartService(_) => "start_service",
            Command::AddCharacteristic { .. } => "add_characteristic",
            Command::ConfigAdvData(_) => "config_adv_data",
            Command::SetDeviceName(_) => "set_device_name",
            Command::StartAdvertising(_) => "start_advertising",
            Command::SecurityResponse { .. } => "security_response",
            Command::BondDeviceCount => "bond_device_count",
            Command::BondDeviceList => "bond_device_list",
            Command::Disconnect(_) => "disconnect",
            Command::RemoveBond(_) => "remove_bond",
            Command::SetEncryption { .. } => "set_encryption",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("simulated failure of {0}")]
    Injected(&'static str),
    #[error("no bond for {0}")]
    UnknownBond(BdAddr),
}

/// A service as the simulated controller holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimService {
    pub handle: u16,
    pub id: ServiceId,
    pub started: bool,
    pub characteristics: Vec<Characteristic>,
}

enum Pending {
    Gap(GapEvent),
    Gatts(GattIf, GattsEvent),
}

struct SimState {
    commands: Vec<Command>,
    failing: HashSet<&'static str>,
    failing_services: HashSet<u16>,
    gap_callback: Option<GapCallback>,
    gatts_callback: Option<GattsCallback>,
    pending: VecDeque<Pending>,
    next_handle: u16,
    services: Vec<SimService>,
    bonds: Vec<BondRecord>,
    connected: Vec<BdAddr>,
    adv_data: Option<AdvData>,
    scan_rsp: Option<AdvData>,
    device_name: Option<String>,
    advertising: bool,
    adv_starts: usize,
}

impl SimState {
    fn new() -> Self {
        Self {
            commands: Vec::new(),
            failing: HashSet::new(),
            failing_services: HashSet::new(),
            gap_callback: None,
            gatts_callback: None,
            pending: VecDeque::new(),
            next_handle: FIRST_SERVICE_HANDLE,
            services: Vec::new(),
            bonds: Vec::new(),
            connected: Vec::new(),
            adv_data: None,
            scan_rsp: None,
            device_name: None,
            advertising: false,
            adv_starts: 0,
        }
    }

    /// Record a command, failing it if a failure was injected for it
    fn issue(&mut self, command: Command) -> Result<(), SimError> {
        let name = command.name();
        self.commands.push(command);
        if self.failing.contains(name) {
            return Err(SimError::Injected(name));
        }
        Ok(())
    }

    fn gap(&mut self, event: GapEvent) {
        self.pending.push_back(Pending::Gap(event));
    }

    fn gatts(&mut self, event: GattsEvent) {
        self.pending.push_back(Pending::Gatts(SIM_GATTS_IF, event));
    }
}

#[derive(Clone)]
pub struct SimulatedStack {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedStack {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedStack {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(SimState::new())) }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call of the named [`BleStack`] method fail
    pub fn fail_command(&self, name: &'static str) {
        self.state().failing.insert(name);
    }

    pub fn clear_failure(&self, name: &'static str) {
        self.state().failing.remove(name);
    }

    /// Report a failed status when a service with this UUID is created
    pub fn fail_service(&self, uuid: u16) {
        self.state().failing_services.insert(uuid);
    }

    /// Commands issued so far, oldest first
    pub fn commands(&self) -> Vec<Command> {
        self.state().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    /// How many issued commands have the given method name
    pub fn count(&self, name: &str) -> usize {
        self.state().commands.iter().filter(|c| c.name() == name).count()
    }

    /// Deliver queued events until none are left. Returns how many were delivered.
    pub fn run_until_idle(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.state().pending.pop_front();
            let Some(pending) = next else {
                return delivered;
            };
            delivered += 1;

            match pending {
                Pending::Gap(event) => {
                    let callback = self.state().gap_callback.take();
                    match callback {
                        Some(mut cb) => {
                            cb(event);
                            self.state().gap_callback.get_or_insert(cb);
                        }
                        None => debug!("sim: dropping GAP event {:?}, no callback", event),
                    }
                }
                Pending::Gatts(gatts_if, event) => {
                    let callback = self.state().gatts_callback.take();
                    match callback {
                        Some(mut cb) => {
                            cb(gatts_if, event);
                            self.state().gatts_callback.get_or_insert(cb);
                        }
                        None => debug!("sim: dropping GATTS event {:?}, no callback", event),
                    }
                }
            }
        }
    }

    /// A central connects. Advertising stops, as it does on a real controller.
    pub fn connect_peer(&self, addr: BdAddr) {
        let mut state = self.state();
        state.advertising = false;
        state.connected.push(addr);
        let conn_id = state.connected.len() as u16 - 1;
        state.gatts(GattsEvent::PeerConnected { conn_id, addr });
    }

    /// The connected central finishes pairing and the stack stores a bond
    pub fn complete_pairing(&self, addr: BdAddr, irk: [u8; 16]) {
        let mut state = self.state();
        state.gap(GapEvent::SecurityRequest { addr });
        state.gap(GapEvent::KeyExchange { key_type: 0x02 });
        state.gap(GapEvent::KeyExchange { key_type: 0x10 });
        state.gap(GapEvent::AuthComplete { addr, success: true, fail_reason: 0 });
        state.bonds.retain(|b| b.addr != addr);
        state.bonds.push(BondRecord { addr, irk });
    }

    /// The central drops the link
    pub fn disconnect_peer(&self, addr: BdAddr) {
        let mut state = self.state();
        if let Some(pos) = state.connected.iter().position(|a| *a == addr) {
            state.connected.remove(pos);
            state.gatts(GattsEvent::PeerDisconnected {
                conn_id: pos as u16,
                addr,
                reason: REASON_REMOTE_USER,
            });
        }
    }

    /// Insert a bond directly, bypassing pairing
    pub fn insert_bond(&self, record: BondRecord) {
        self.state().bonds.push(record);
    }

    pub fn bonds(&self) -> Vec<BondRecord> {
        self.state().bonds.clone()
    }

    pub fn services(&self) -> Vec<SimService> {
        self.state().services.clone()
    }

    pub fn is_advertising(&self) -> bool {
        self.state().advertising
    }

    pub fn adv_starts(&self) -> usize {
        self.state().adv_starts
    }

    /// Current advertising payload
    pub fn adv_data(&self) -> Option<AdvData> {
        self.state().adv_data.clone()
    }

    /// Current scan response payload
    pub fn scan_rsp(&self) -> Option<AdvData> {
        self.state().scan_rsp.clone()
    }

    pub fn device_name(&self) -> Option<String> {
        self.state().device_name.clone()
    }

    pub fn is_connected(&self, addr: BdAddr) -> bool {
        self.state().connected.contains(&addr)
    }
}

impl BleStack for SimulatedStack {
    type Error = SimError;

    fn register_gap_callback(&self, callback: GapCallback) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::RegisterGapCallback)?;
        state.gap_callback = Some(callback);
        Ok(())
    }

    fn register_gatts_callback(&self, callback: GattsCallback) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::RegisterGattsCallback)?;
        state.gatts_callback = Some(callback);
        Ok(())
    }

    fn register_app(&self, app_id: u16) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::RegisterApp(app_id))?;
        state.gatts(GattsEvent::AppRegistered { status: Status::Ok, app_id });
        Ok(())
    }

    fn set_security_param(&self, param: SecurityParam) -> Result<(), SimError> {
        self.state().issue(Command::SetSecurityParam(param))
    }

    fn create_service(&self, gatts_if: GattIf, service: &ServiceId, num_handles: u16) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::CreateService { gatts_if, service: *service, num_handles })?;

        let forced_failure = service
            .uuid
            .as_u16()
            .is_some_and(|uuid| state.failing_services.contains(&uuid));
        if forced_failure {
            state.gatts(GattsEvent::ServiceCreated {
                status: Status::Failed(GATT_ERROR),
                service_handle: 0,
                service_id: *service,
            });
            return Ok(());
        }

        let handle = state.next_handle;
        state.next_handle += num_handles;
        state.services.push(SimService {
            handle,
            id: *service,
            started: false,
            characteristics: Vec::new(),
        });
        state.gatts(GattsEvent::ServiceCreated {
            status: Status::Ok,
            service_handle: handle,
            service_id: *service,
        });
        Ok(())
    }

    fn start_service(&self, service_handle: u16) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::StartService(service_handle))?;
        let status = match state.services.iter_mut().find(|s| s.handle == service_handle) {
            Some(service) => {
                service.started = true;
                Status::Ok
            }
            None => Status::Failed(GATT_ERROR),
        };
        state.gatts(GattsEvent::ServiceStarted { status, service_handle });
        Ok(())
    }

    fn add_characteristic(&self, service_handle: u16, characteristic: &Characteristic) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::AddCharacteristic {
            service_handle,
            characteristic: characteristic.clone(),
        })?;
        let uuid: BtUuid = characteristic.uuid;
        let event = match state.services.iter_mut().find(|s| s.handle == service_handle) {
            Some(service) => {
                service.characteristics.push(characteristic.clone());
                let attr_handle = service_handle + 2 * service.characteristics.len() as u16;
                GattsEvent::CharacteristicAdded { status: Status::Ok, service_handle, attr_handle, uuid }
            }
            None => GattsEvent::CharacteristicAdded {
                status: Status::Failed(GATT_ERROR),
                service_handle,
                attr_handle: 0,
                uuid,
            },
        };
        state.gatts(event);
        Ok(())
    }

    fn config_adv_data(&self, data: &AdvData) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::ConfigAdvData(data.clone()))?;
        if data.set_scan_rsp {
            state.scan_rsp = Some(data.clone());
            state.gap(GapEvent::ScanRspDataSetComplete { status: Status::Ok });
        } else {
            state.adv_data = Some(data.clone());
            state.gap(GapEvent::AdvDataSetComplete { status: Status::Ok });
        }
        Ok(())
    }

    fn set_device_name(&self, name: &str) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::SetDeviceName(name.to_string()))?;
        state.device_name = Some(name.to_string());
        Ok(())
    }

    fn start_advertising(&self, params: &AdvParams) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::StartAdvertising(*params))?;
        state.advertising = true;
        state.adv_starts += 1;
        state.gap(GapEvent::AdvStartComplete { status: Status::Ok });
        Ok(())
    }

    fn security_response(&self, addr: BdAddr, accept: bool) -> Result<(), SimError> {
        self.state().issue(Command::SecurityResponse { addr, accept })
    }

    fn bond_device_count(&self) -> Result<usize, SimError> {
        let mut state = self.state();
        state.issue(Command::BondDeviceCount)?;
        Ok(state.bonds.len())
    }

    fn bond_device_list(&self) -> Result<Vec<BondRecord>, SimError> {
        let mut state = self.state();
        state.issue(Command::BondDeviceList)?;
        Ok(state.bonds.clone())
    }

    fn disconnect(&self, addr: BdAddr) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::Disconnect(addr))?;
        if let Some(pos) = state.connected.iter().position(|a| *a == addr) {
            state.connected.remove(pos);
            state.gatts(GattsEvent::PeerDisconnected {
                conn_id: pos as u16,
                addr,
                reason: REASON_LOCAL_HOST,
            });
        }
        Ok(())
    }

    fn remove_bond(&self, addr: BdAddr) -> Result<(), SimError> {
        let mut state = self.state();
        state.issue(Command::RemoveBond(addr))?;
        let before = state.bonds.len();
        state.bonds.retain(|b| b.addr != addr);
        if state.bonds.len() == before {
            return Err(SimError::UnknownBond(addr));
        }
        Ok(())
    }

    fn set_encryption(&self, addr: BdAddr, level: EncryptionLevel) -> Result<(), SimError> {
        self.state().issue(Command::SetEncryption { addr, level })
    }
}
