//! Advertising controller
//!
//! Every call rebuilds both payloads and restarts advertising from scratch, so
//! it is safe after bring-up and after each disconnect alike.

use irk_proto::ble::{flags, ADV_CONN_INTERVAL_MAX, ADV_CONN_INTERVAL_MIN, ADV_SERVICE_UUID128};
use log::*;

use crate::config::AdvertisingConfig;
use crate::stack::{AdvData, AdvFilterPolicy, AdvParams, AdvType, BleStack, OwnAddrType};

/// All three advertising channels
const ADV_CHANNEL_ALL: u8 = 0x07;

pub struct Advertiser {
    device_name: String,
    config: AdvertisingConfig,
}

impl Advertiser {
    pub fn new(device_name: &str, config: AdvertisingConfig) -> Self {
        Self { device_name: device_name.to_string(), config }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Advertisement: name, TX power, appearance, the 128-bit service UUID,
    /// manufacturer data and discoverability flags
    pub fn adv_data(&self) -> AdvData {
        AdvData {
            set_scan_rsp: false,
            include_name: true,
            include_txpower: true,
            min_interval: ADV_CONN_INTERVAL_MIN,
            max_interval: ADV_CONN_INTERVAL_MAX,
            appearance: self.config.appearance,
            manufacturer_data: self.config.manufacturer_data.clone(),
            service_uuid: Some(ADV_SERVICE_UUID128),
            flag: flags::GEN_DISC | flags::BREDR_NOT_SPT,
        }
    }

    /// Scan response: name and TX power only
    pub fn scan_rsp_data(&self) -> AdvData {
        AdvData {
            set_scan_rsp: true,
            include_name: true,
            include_txpower: true,
            ..AdvData::default()
        }
    }

    pub fn params(&self) -> AdvParams {
        AdvParams {
            interval_min: self.config.interval_min,
            interval_max: self.config.interval_max,
            adv_type: AdvType::Ind,
            own_addr_type: OwnAddrType::Public,
            channel_map: ADV_CHANNEL_ALL,
            filter_policy: AdvFilterPolicy::AllowScanAnyConnAny,
        }
    }

    /// Configure payloads and (re)start advertising. A failed payload step
    /// abandons this attempt; the next disconnect tries again.
    ///
    /// Returns whether start-advertising was accepted by the stack.
    pub fn start_or_restart<S: BleStack>(&self, stack: &S) -> bool {
        // the name goes first: the stack reads it when building the payloads
        if let Err(e) = stack.set_device_name(&self.device_name) {
            warn!("Failed to set device name: {}", e);
        }

        if let Err(e) = stack.config_adv_data(&self.adv_data()) {
            error!("Failed to config adv data: {}", e);
            return false;
        }
        if let Err(e) = stack.config_adv_data(&self.scan_rsp_data()) {
            error!("Failed to config scan response data: {}", e);
            return false;
        }

        match stack.start_advertising(&self.params()) {
            Ok(()) => {
                info!("Started BLE advertising as '{}'", self.device_name);
                true
            }
            Err(e) => {
                error!("Failed to start advertising: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedStack;

    fn advertiser() -> Advertiser {
        Advertiser::new("IRK Collector", AdvertisingConfig::default())
    }

    #[test]
    fn payloads() {
        let adv = advertiser();
        let data = adv.adv_data();
        assert!(!data.set_scan_rsp);
        assert!(data.include_name && data.include_txpower);
        assert_eq!(data.flag, 0x06);
        assert_eq!(data.appearance, 0x0341);
        assert_eq!(data.manufacturer_data, vec![0xFF, 0xFF, 0x01, 0x02]);
        assert_eq!(data.service_uuid.map(|u| (u[12], u[13])), Some((0x0D, 0x18)));

        let rsp = adv.scan_rsp_data();
        assert!(rsp.set_scan_rsp);
        assert!(rsp.include_name && rsp.include_txpower);
        assert_eq!(rsp.flag, 0);
        assert_eq!(rsp.service_uuid, None);

        let params = adv.params();
        assert_eq!((params.interval_min, params.interval_max), (0x20, 0x40));
        assert_eq!(params.filter_policy, AdvFilterPolicy::AllowScanAnyConnAny);
        assert_eq!(params.adv_type, AdvType::Ind);
    }

    #[test]
    fn restart_is_idempotent() {
        let stack = SimulatedStack::new();
        let adv = advertiser();

        assert!(adv.start_or_restart(&stack));
        let first = (stack.adv_data(), stack.scan_rsp());
        assert!(adv.start_or_restart(&stack));

        assert!(stack.is_advertising());
        assert_eq!(stack.adv_starts(), 2);
        assert_eq!((stack.adv_data(), stack.scan_rsp()), first);
        assert_eq!(stack.device_name().as_deref(), Some("IRK Collector"));
        assert_eq!(stack.count("config_adv_data"), 4);
    }

    #[test]
    fn adv_data_failure_is_not_fatal() {
        let stack = SimulatedStack::new();
        let adv = advertiser();
        stack.fail_command("config_adv_data");
        assert!(!adv.start_or_restart(&stack));
        assert_eq!(stack.count("start_advertising"), 0);

        stack.clear_failure("config_adv_data");
        assert!(adv.start_or_restart(&stack));
        assert!(stack.is_advertising());
    }

    #[test]
    fn name_failure_does_not_block_advertising() {
        let stack = SimulatedStack::new();
        stack.fail_command("set_device_name");
        assert!(advertiser().start_or_restart(&stack));
    }
}
