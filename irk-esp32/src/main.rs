//! IRK Collector for ESP32
//!
//! Advertises as a connectable peripheral, lets any phone or watch pair, logs
//! the Identity Resolving Key it hands out and forgets the bond again.

mod bluedroid;

use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::{
    bt::{Ble, BtDriver},
    hal::prelude::Peripherals,
    nvs::EspDefaultNvsPartition,
};
use irk_enrollment::{Component, EnrollmentConfig, IrkEnrollment};
use log::*;

use bluedroid::Bluedroid;

// Configuration
const DEVICE_NAME: &str = irk_proto::DEFAULT_DEVICE_NAME;
const POLL_INTERVAL_MS: u32 = 1000;

fn main() -> anyhow::Result<()> {
    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("{} v{}", irk_proto::DEFAULT_MODEL, env!("CARGO_PKG_VERSION"));
    info!("Initializing...");

    let peripherals = Peripherals::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // Controller and Bluedroid host; bonds are persisted in NVS
    let bt = BtDriver::<Ble>::new(peripherals.modem, Some(nvs.clone()))?;
    info!("Bluetooth enabled");

    let config = EnrollmentConfig { device_name: DEVICE_NAME.to_string(), ..Default::default() };

    let mut collector = IrkEnrollment::new(Bluedroid::new(&bt), &config);
    collector.set_latest_irk(|irk: &str| {
        info!("=== NEW IRK ===");
        info!("  {}", irk);
        info!("===============");
    });

    if let Err(e) = collector.setup() {
        error!("IRK enrollment setup failed: {}", e);
        error!("{}", collector.dump_config());
        return Err(e.into());
    }
    info!("{}", collector.dump_config());

    loop {
        collector.poll();
        FreeRtos::delay_ms(POLL_INTERVAL_MS);
    }
}
