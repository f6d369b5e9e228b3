//! Enrollment configuration
//!
//! Every field has a default, so `{}` is a valid config file.

use irk_proto::ble::{
    ADV_APPEARANCE, ADV_INTERVAL_CEILING, ADV_INTERVAL_FLOOR, ADV_INTERVAL_MAX, ADV_INTERVAL_MIN,
    ADV_MANUFACTURER_DATA, MAX_DEVICE_NAME_LEN, MAX_MANUFACTURER_DATA_LEN,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::security::SecurityPolicy;

/// Order in which the two GATT services are created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOrder {
    #[default]
    DeviceInfoFirst,
    HeartRateFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertisingConfig {
    /// Advertising interval, 0.625 ms units
    pub interval_min: u16,
    pub interval_max: u16,
    pub appearance: u16,
    pub manufacturer_data: Vec<u8>,
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        Self {
            interval_min: ADV_INTERVAL_MIN,
            interval_max: ADV_INTERVAL_MAX,
            appearance: ADV_APPEARANCE,
            manufacturer_data: ADV_MANUFACTURER_DATA.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollmentConfig {
    pub device_name: String,
    /// Device Information: Manufacturer Name
    pub manufacturer: String,
    /// Device Information: Model Number
    pub model: String,
    pub app_id: u16,
    pub service_order: ServiceOrder,
    pub security: SecurityPolicy,
    pub advertising: AdvertisingConfig,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            device_name: irk_proto::DEFAULT_DEVICE_NAME.to_string(),
            manufacturer: irk_proto::DEFAULT_MANUFACTURER.to_string(),
            model: irk_proto::DEFAULT_MODEL.to_string(),
            app_id: irk_proto::DEFAULT_APP_ID,
            service_order: ServiceOrder::default(),
            security: SecurityPolicy::default(),
            advertising: AdvertisingConfig::default(),
        }
    }
}

impl EnrollmentConfig {
    /// Parse and validate a JSON config
    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }
        if self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::DeviceNameTooLong(self.device_name.len()));
        }

        let adv = &self.advertising;
        if adv.interval_min < ADV_INTERVAL_FLOOR
            || adv.interval_max > ADV_INTERVAL_CEILING
            || adv.interval_min > adv.interval_max
        {
            return Err(ConfigError::AdvInterval { min: adv.interval_min, max: adv.interval_max });
        }

        if adv.manufacturer_data.len() > MAX_MANUFACTURER_DATA_LEN {
            return Err(ConfigError::ManufacturerDataTooLong(adv.manufacturer_data.len()));
        }

        let key_size = self.security.max_key_size;
        if !(irk_proto::MIN_KEY_SIZE..=irk_proto::MAX_KEY_SIZE).contains(&key_size) {
            return Err(ConfigError::KeySize(key_size));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::AuthReq;

    #[test]
    fn empty_json_is_default() {
        let config = EnrollmentConfig::from_json("{}").unwrap();
        assert_eq!(config, EnrollmentConfig::default());
        assert_eq!(config.advertising.interval_min, 0x20);
        assert_eq!(config.advertising.interval_max, 0x40);
    }

    #[test]
    fn round_trip() {
        let config = EnrollmentConfig {
            device_name: "Collector 2".to_string(),
            service_order: ServiceOrder::HeartRateFirst,
            ..Default::default()
        };
        let parsed = EnrollmentConfig::from_json(&config.to_json()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_override() {
        let config = EnrollmentConfig::from_json(
            r#"{"security": {"auth_req": "bond"}, "service_order": "heart_rate_first"}"#,
        )
        .unwrap();
        assert_eq!(config.security.auth_req, AuthReq::Bond);
        assert_eq!(config.security.max_key_size, 16);
        assert_eq!(config.service_order, ServiceOrder::HeartRateFirst);
    }

    #[test]
    fn rejects_bad_intervals() {
        let err = EnrollmentConfig::from_json(
            r#"{"advertising": {"interval_min": 64, "interval_max": 32}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::AdvInterval { min: 64, max: 32 }));

        let err = EnrollmentConfig::from_json(r#"{"advertising": {"interval_min": 8}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::AdvInterval { .. }));
    }

    #[test]
    fn rejects_bad_names_and_keys() {
        assert!(matches!(
            EnrollmentConfig::from_json(r#"{"device_name": ""}"#),
            Err(ConfigError::EmptyDeviceName)
        ));
        let long = format!(r#"{{"device_name": "{}"}}"#, "x".repeat(40));
        assert!(matches!(
            EnrollmentConfig::from_json(&long),
            Err(ConfigError::DeviceNameTooLong(40))
        ));
        assert!(matches!(
            EnrollmentConfig::from_json(r#"{"security": {"max_key_size": 32}}"#),
            Err(ConfigError::KeySize(32))
        ));
    }

    #[test]
    fn rejects_oversized_manufacturer_data() {
        let mut config = EnrollmentConfig::default();
        config.advertising.manufacturer_data = vec![0xAB; 29];
        assert!(config.validate().is_ok());

        config.advertising.manufacturer_data = vec![0xAB; 30];
        assert!(matches!(config.validate(), Err(ConfigError::ManufacturerDataTooLong(30))));
    }

    #[test]
    fn malformed_json() {
        assert!(matches!(EnrollmentConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
