//! `BleStack` over the ESP-IDF Bluedroid host
//!
//! Bluedroid callbacks are plain C function pointers without a user argument,
//! so the Rust callbacks live in static slots. Every command only queues work
//! for the BTC task and returns; results arrive through the callbacks.

use std::ffi::CString;
use std::sync::Mutex;

use esp_idf_svc::bt::{Ble, BtDriver};
use esp_idf_svc::sys::{self, esp, EspError, ESP_ERR_INVALID_ARG, ESP_FAIL};
use irk_enrollment::{
    AdvData, AdvFilterPolicy, AdvParams, AdvType, AuthReq, BdAddr, BleStack, BondRecord, BtUuid,
    Characteristic, EncryptionLevel, GapCallback, GapEvent, GattIf, GattsCallback, GattsEvent,
    IoCap, KeyMask, OwnAddrType, SecurityParam, ServiceId, Status,
};
use log::*;

static GAP_HANDLER: Mutex<Option<GapCallback>> = Mutex::new(None);
static GATTS_HANDLER: Mutex<Option<GattsCallback>> = Mutex::new(None);

// Values from esp_gap_ble_api.h / esp_gatt_defs.h
const LE_AUTH_BOND: u8 = 0x01;
const LE_AUTH_REQ_MITM: u8 = 0x04;
const LE_AUTH_REQ_SC_ONLY: u8 = 0x08;

const IO_CAP_OUT: u8 = 0;
const IO_CAP_IO: u8 = 1;
const IO_CAP_IN: u8 = 2;
const IO_CAP_NONE: u8 = 3;
const IO_CAP_KBDISP: u8 = 4;

const ENC_KEY_MASK: u8 = 1 << 0;
const ID_KEY_MASK: u8 = 1 << 1;

const GATT_PERM_READ: u16 = 1 << 0;
const GATT_PERM_READ_ENCRYPTED: u16 = 1 << 1;
const GATT_PERM_WRITE: u16 = 1 << 4;

const GATT_CHAR_PROP_READ: u8 = 1 << 1;
const GATT_CHAR_PROP_WRITE: u8 = 1 << 3;
const GATT_CHAR_PROP_NOTIFY: u8 = 1 << 4;

/// Handle on the Bluedroid host. Only created once the controller is enabled.
pub struct Bluedroid {
    _private: (),
}

impl Bluedroid {
    pub fn new(_driver: &BtDriver<'_, Ble>) -> Self {
        Self { _private: () }
    }
}

fn invalid_arg() -> EspError {
    EspError::from_infallible::<ESP_ERR_INVALID_ARG>()
}

fn auth_req(req: AuthReq) -> u8 {
    match req {
        AuthReq::Bond => LE_AUTH_BOND,
        AuthReq::MitmBond => LE_AUTH_REQ_MITM | LE_AUTH_BOND,
        AuthReq::ScBond => LE_AUTH_REQ_SC_ONLY | LE_AUTH_BOND,
        AuthReq::ScMitmBond => LE_AUTH_REQ_SC_ONLY | LE_AUTH_REQ_MITM | LE_AUTH_BOND,
    }
}

fn io_cap(cap: IoCap) -> u8 {
    match cap {
        IoCap::DisplayOnly => IO_CAP_OUT,
        IoCap::DisplayYesNo => IO_CAP_IO,
        IoCap::KeyboardOnly => IO_CAP_IN,
        IoCap::None => IO_CAP_NONE,
        IoCap::KeyboardDisplay => IO_CAP_KBDISP,
    }
}

fn key_mask(mask: KeyMask) -> u8 {
    let mut bits = 0;
    if mask.enc {
        bits |= ENC_KEY_MASK;
    }
    if mask.id {
        bits |= ID_KEY_MASK;
    }
    bits
}

fn bt_uuid(uuid: BtUuid) -> sys::esp_bt_uuid_t {
    let mut raw = sys::esp_bt_uuid_t::default();
    match uuid {
        BtUuid::Uuid16(u) => {
            raw.len = 2;
            raw.uuid.uuid16 = u;
        }
        BtUuid::Uuid32(u) => {
            raw.len = 4;
            raw.uuid.uuid32 = u;
        }
        BtUuid::Uuid128(u) => {
            raw.len = 16;
            raw.uuid.uuid128 = u;
        }
    }
    raw
}

fn from_bt_uuid(raw: &sys::esp_bt_uuid_t) -> BtUuid {
    // SAFETY: `len` selects the active union member
    unsafe {
        match raw.len {
            2 => BtUuid::Uuid16(raw.uuid.uuid16),
            4 => BtUuid::Uuid32(raw.uuid.uuid32),
            _ => BtUuid::Uuid128(raw.uuid.uuid128),
        }
    }
}

fn from_service_id(raw: &sys::esp_gatt_srvc_id_t) -> ServiceId {
    ServiceId {
        uuid: from_bt_uuid(&raw.id.uuid),
        inst_id: raw.id.inst_id,
        is_primary: raw.is_primary,
    }
}

fn status(code: u32) -> Status {
    if code == 0 {
        Status::Ok
    } else {
        Status::Failed(code as u16)
    }
}

impl BleStack for Bluedroid {
    type Error = EspError;

    fn register_gap_callback(&self, callback: GapCallback) -> Result<(), EspError> {
        *GAP_HANDLER.lock().map_err(|_| EspError::from_infallible::<ESP_FAIL>())? = Some(callback);
        esp!(unsafe { sys::esp_ble_gap_register_callback(Some(gap_event_handler)) })
    }

    fn register_gatts_callback(&self, callback: GattsCallback) -> Result<(), EspError> {
        *GATTS_HANDLER.lock().map_err(|_| EspError::from_infallible::<ESP_FAIL>())? = Some(callback);
        esp!(unsafe { sys::esp_ble_gatts_register_callback(Some(gatts_event_handler)) })
    }

    fn register_app(&self, app_id: u16) -> Result<(), EspError> {
        esp!(unsafe { sys::esp_ble_gatts_app_register(app_id) })
    }

    fn set_security_param(&self, param: SecurityParam) -> Result<(), EspError> {
        let (kind, mut value) = match param {
            SecurityParam::AuthReq(req) => (sys::esp_ble_sm_param_t_ESP_BLE_SM_AUTHEN_REQ_MODE, auth_req(req)),
            SecurityParam::IoCap(cap) => (sys::esp_ble_sm_param_t_ESP_BLE_SM_IOCAP_MODE, io_cap(cap)),
            SecurityParam::MaxKeySize(size) => (sys::esp_ble_sm_param_t_ESP_BLE_SM_MAX_KEY_SIZE, size),
            SecurityParam::InitKey(mask) => (sys::esp_ble_sm_param_t_ESP_BLE_SM_SET_INIT_KEY, key_mask(mask)),
            SecurityParam::RspKey(mask) => (sys::esp_ble_sm_param_t_ESP_BLE_SM_SET_RSP_KEY, key_mask(mask)),
        };
        esp!(unsafe {
            sys::esp_ble_gap_set_security_param(kind, &mut value as *mut u8 as *mut core::ffi::c_void, 1)
        })
    }

    fn create_service(&self, gatts_if: GattIf, service: &ServiceId, num_handles: u16) -> Result<(), EspError> {
        let mut id = sys::esp_gatt_srvc_id_t {
            id: sys::esp_gatt_id_t { uuid: bt_uuid(service.uuid), inst_id: service.inst_id },
            is_primary: service.is_primary,
        };
        esp!(unsafe { sys::esp_ble_gatts_create_service(gatts_if, &mut id, num_handles) })
    }

    fn start_service(&self, service_handle: u16) -> Result<(), EspError> {
        esp!(unsafe { sys::esp_ble_gatts_start_service(service_handle) })
    }

    fn add_characteristic(&self, service_handle: u16, characteristic: &Characteristic) -> Result<(), EspError> {
        let mut uuid = bt_uuid(characteristic.uuid);

        let p = characteristic.permissions;
        let mut perm = 0;
        if p.read {
            perm |= GATT_PERM_READ;
        }
        if p.read_encrypted {
            perm |= GATT_PERM_READ_ENCRYPTED;
        }
        if p.write {
            perm |= GATT_PERM_WRITE;
        }

        let pr = characteristic.properties;
        let mut prop = 0;
        if pr.read {
            prop |= GATT_CHAR_PROP_READ;
        }
        if pr.write {
            prop |= GATT_CHAR_PROP_WRITE;
        }
        if pr.notify {
            prop |= GATT_CHAR_PROP_NOTIFY;
        }

        // the stack copies the value before this returns
        let mut value = characteristic.value.clone();
        let len = u16::try_from(value.len()).map_err(|_| invalid_arg())?;
        let mut attr = sys::esp_attr_value_t { attr_max_len: len, attr_len: len, attr_value: value.as_mut_ptr() };

        esp!(unsafe {
            sys::esp_ble_gatts_add_char(service_handle, &mut uuid, perm, prop, &mut attr, core::ptr::null_mut())
        })
    }

    fn config_adv_data(&self, data: &AdvData) -> Result<(), EspError> {
        let mut manufacturer = data.manufacturer_data.clone();
        let mut service_uuid = data.service_uuid;

        let mut raw = sys::esp_ble_adv_data_t {
            set_scan_rsp: data.set_scan_rsp,
            include_name: data.include_name,
            include_txpower: data.include_txpower,
            min_interval: data.min_interval as i32,
            max_interval: data.max_interval as i32,
            appearance: data.appearance as i32,
            manufacturer_len: u16::try_from(manufacturer.len()).map_err(|_| invalid_arg())?,
            p_manufacturer_data: if manufacturer.is_empty() { core::ptr::null_mut() } else { manufacturer.as_mut_ptr() },
            service_data_len: 0,
            p_service_data: core::ptr::null_mut(),
            service_uuid_len: if service_uuid.is_some() { 16 } else { 0 },
            p_service_uuid: service_uuid.as_mut().map_or(core::ptr::null_mut(), |u| u.as_mut_ptr()),
            flag: data.flag,
        };
        esp!(unsafe { sys::esp_ble_gap_config_adv_data(&mut raw) })
    }

    fn set_device_name(&self, name: &str) -> Result<(), EspError> {
        let name = CString::new(name).map_err(|_| invalid_arg())?;
        esp!(unsafe { sys::esp_ble_gap_set_device_name(name.as_ptr()) })
    }

    fn start_advertising(&self, params: &AdvParams) -> Result<(), EspError> {
        let mut raw = sys::esp_ble_adv_params_t {
            adv_int_min: params.interval_min,
            adv_int_max: params.interval_max,
            adv_type: match params.adv_type {
                AdvType::Ind => sys::esp_ble_adv_type_t_ADV_TYPE_IND,
                AdvType::NonConnInd => sys::esp_ble_adv_type_t_ADV_TYPE_NONCONN_IND,
            },
            own_addr_type: match params.own_addr_type {
                OwnAddrType::Public => sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
                OwnAddrType::Random => sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_RANDOM,
            },
            peer_addr: [0; 6],
            peer_addr_type: sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
            channel_map: params.channel_map as _,
            adv_filter_policy: match params.filter_policy {
                AdvFilterPolicy::AllowScanAnyConnAny => sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
                AdvFilterPolicy::AllowScanWlstConnAny => sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_WLST_CON_ANY,
                AdvFilterPolicy::AllowScanAnyConnWlst => sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_WLST,
                AdvFilterPolicy::AllowScanWlstConnWlst => sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_WLST_CON_WLST,
            },
        };
        esp!(unsafe { sys::esp_ble_gap_start_advertising(&mut raw) })
    }

    fn security_response(&self, addr: BdAddr, accept: bool) -> Result<(), EspError> {
        let mut bda = addr.0;
        esp!(unsafe { sys::esp_ble_gap_security_rsp(bda.as_mut_ptr(), accept) })
    }

    fn bond_device_count(&self) -> Result<usize, EspError> {
        let count = unsafe { sys::esp_ble_get_bond_device_num() };
        usize::try_from(count).map_err(|_| EspError::from_infallible::<ESP_FAIL>())
    }

    fn bond_device_list(&self) -> Result<Vec<BondRecord>, EspError> {
        let count = self.bond_device_count()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut list = vec![sys::esp_ble_bond_dev_t::default(); count];
        let mut num = count as i32;
        esp!(unsafe { sys::esp_ble_get_bond_device_list(&mut num, list.as_mut_ptr()) })?;
        list.truncate(num.max(0) as usize);

        Ok(list
            .iter()
            .map(|dev| BondRecord { addr: BdAddr(dev.bd_addr), irk: dev.bond_key.pid_key.irk })
            .collect())
    }

    fn disconnect(&self, addr: BdAddr) -> Result<(), EspError> {
        let mut bda = addr.0;
        esp!(unsafe { sys::esp_ble_gap_disconnect(bda.as_mut_ptr()) })
    }

    fn remove_bond(&self, addr: BdAddr) -> Result<(), EspError> {
        let mut bda = addr.0;
        esp!(unsafe { sys::esp_ble_remove_bond_device(bda.as_mut_ptr()) })
    }

    fn set_encryption(&self, addr: BdAddr, level: EncryptionLevel) -> Result<(), EspError> {
        let mut bda = addr.0;
        let action = match level {
            EncryptionLevel::Encrypt => sys::esp_ble_sec_act_t_ESP_BLE_SEC_ENCRYPT,
            EncryptionLevel::EncryptNoMitm => sys::esp_ble_sec_act_t_ESP_BLE_SEC_ENCRYPT_NO_MITM,
            EncryptionLevel::EncryptMitm => sys::esp_ble_sec_act_t_ESP_BLE_SEC_ENCRYPT_MITM,
        };
        esp!(unsafe { sys::esp_ble_set_encryption(bda.as_mut_ptr(), action) })
    }
}

/// Translate a raw GAP event
///
/// # Safety
/// `param` must be the parameter block Bluedroid passed with `event`.
unsafe fn gap_event(event: sys::esp_gap_ble_cb_event_t, param: *mut sys::esp_ble_gap_cb_param_t) -> GapEvent {
    let p = &*param;
    match event {
        sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_DATA_SET_COMPLETE_EVT => {
            GapEvent::AdvDataSetComplete { status: status(p.adv_data_cmpl.status as u32) }
        }
        sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_SCAN_RSP_DATA_SET_COMPLETE_EVT => {
            GapEvent::ScanRspDataSetComplete { status: status(p.scan_rsp_data_cmpl.status as u32) }
        }
        sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_START_COMPLETE_EVT => {
            GapEvent::AdvStartComplete { status: status(p.adv_start_cmpl.status as u32) }
        }
        sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_KEY_EVT => {
            GapEvent::KeyExchange { key_type: p.ble_security.ble_key.key_type as u8 }
        }
        sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_SEC_REQ_EVT => {
            GapEvent::SecurityRequest { addr: BdAddr(p.ble_security.ble_req.bd_addr) }
        }
        sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_AUTH_CMPL_EVT => {
            let auth = &p.ble_security.auth_cmpl;
            GapEvent::AuthComplete { addr: BdAddr(auth.bd_addr), success: auth.success, fail_reason: auth.fail_reason as u8 }
        }
        other => GapEvent::Other(other as u32),
    }
}

/// Translate a raw GATT server event
///
/// # Safety
/// `param` must be the parameter block Bluedroid passed with `event`.
unsafe fn gatts_event(event: sys::esp_gatts_cb_event_t, param: *mut sys::esp_ble_gatts_cb_param_t) -> GattsEvent {
    let p = &*param;
    match event {
        sys::esp_gatts_cb_event_t_ESP_GATTS_REG_EVT => {
            GattsEvent::AppRegistered { status: status(p.reg.status as u32), app_id: p.reg.app_id }
        }
        sys::esp_gatts_cb_event_t_ESP_GATTS_CREATE_EVT => GattsEvent::ServiceCreated {
            status: status(p.create.status as u32),
            service_handle: p.create.service_handle,
            service_id: from_service_id(&p.create.service_id),
        },
        sys::esp_gatts_cb_event_t_ESP_GATTS_START_EVT => GattsEvent::ServiceStarted {
            status: status(p.start.status as u32),
            service_handle: p.start.service_handle,
        },
        sys::esp_gatts_cb_event_t_ESP_GATTS_ADD_CHAR_EVT => GattsEvent::CharacteristicAdded {
            status: status(p.add_char.status as u32),
            service_handle: p.add_char.service_handle,
            attr_handle: p.add_char.attr_handle,
            uuid: from_bt_uuid(&p.add_char.char_uuid),
        },
        sys::esp_gatts_cb_event_t_ESP_GATTS_CONNECT_EVT => GattsEvent::PeerConnected {
            conn_id: p.connect.conn_id,
            addr: BdAddr(p.connect.remote_bda),
        },
        sys::esp_gatts_cb_event_t_ESP_GATTS_DISCONNECT_EVT => GattsEvent::PeerDisconnected {
            conn_id: p.disconnect.conn_id,
            addr: BdAddr(p.disconnect.remote_bda),
            reason: p.disconnect.reason as u16,
        },
        other => GattsEvent::Other(other as u32),
    }
}

unsafe extern "C" fn gap_event_handler(event: sys::esp_gap_ble_cb_event_t, param: *mut sys::esp_ble_gap_cb_param_t) {
    if param.is_null() {
        return;
    }
    let event = unsafe { gap_event(event, param) };
    match GAP_HANDLER.lock() {
        Ok(mut slot) => {
            if let Some(handler) = slot.as_mut() {
                handler(event);
            }
        }
        Err(_) => error!("GAP handler slot poisoned"),
    }
}

unsafe extern "C" fn gatts_event_handler(
    event: sys::esp_gatts_cb_event_t,
    gatts_if: sys::esp_gatt_if_t,
    param: *mut sys::esp_ble_gatts_cb_param_t,
) {
    if param.is_null() {
        return;
    }
    let event = unsafe { gatts_event(event, param) };
    match GATTS_HANDLER.lock() {
        Ok(mut slot) => {
            if let Some(handler) = slot.as_mut() {
                handler(gatts_if, event);
            }
        }
        Err(_) => error!("GATTS handler slot poisoned"),
    }
}
