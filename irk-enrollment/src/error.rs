/// Bring-up failures. Any of these marks the component failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to register GAP callback: {0}")]
    RegisterGapCallback(String),
    #[error("failed to register GATTS callback: {0}")]
    RegisterGattsCallback(String),
    #[error("failed to register GATTS app: {0}")]
    RegisterApp(String),
    #[error("component failed during an earlier setup")]
    Failed,
    #[error("component state lock poisoned")]
    Poisoned,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("device name must not be empty")]
    EmptyDeviceName,
    #[error("device name is {0} bytes, at most {max} fit the scan response", max = irk_proto::ble::MAX_DEVICE_NAME_LEN)]
    DeviceNameTooLong(usize),
    #[error("advertising interval 0x{min:04x}..0x{max:04x} is invalid")]
    AdvInterval { min: u16, max: u16 },
    #[error("manufacturer data is {0} bytes, at most {max} fit an advertisement", max = irk_proto::ble::MAX_MANUFACTURER_DATA_LEN)]
    ManufacturerDataTooLong(usize),
    #[error("max key size {0} outside 7..=16")]
    KeySize(u8),
}
