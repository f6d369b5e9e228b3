//! Desktop companion for IRK collectors
//!
//! Scans for collectors advertising nearby, runs enrollments against the
//! simulated stack, and checks configuration files before they are flashed.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, anyhow};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use irk_enrollment::sim::SimulatedStack;
use irk_enrollment::{BdAddr, Component, EnrollmentConfig, IrkEnrollment, Stats};
use irk_proto::ble::{ADV_MANUFACTURER_DATA, ADV_SERVICE_UUID128};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "irk-ble")]
#[command(about = "Companion tool for BLE IRK collectors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for IRK collectors
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Configuration file whose device name to look for
        #[arg(short, long)]
        config: Option<String>,
        /// List every device, not only collectors
        #[arg(short, long)]
        all: bool,
    },
    /// Run enrollments against an in-memory BLE stack
    Simulate {
        /// Number of centrals that pair one after another
        #[arg(short, long, default_value = "3")]
        pairings: usize,
        /// Configuration file (JSON); defaults are used when omitted
        #[arg(short, long)]
        config: Option<String>,
        /// Let every central hand out the same IRK
        #[arg(long)]
        same_irk: bool,
    },
    /// Print the default configuration, or validate a file
    Config {
        /// Configuration file to validate
        file: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { duration, config, all } => {
            let config = load_config(config.as_deref())?;
            let adapter = get_adapter().await?;
            scan_collectors(&adapter, &config, duration, all).await?;
        }
        Commands::Simulate { pairings, config, same_irk } => {
            let config = load_config(config.as_deref())?;
            simulate(&config, pairings, same_irk)?;
        }
        Commands::Config { file } => match file {
            Some(file) => {
                let config = load_config(Some(&file))?;
                println!("{} is valid:", file);
                println!("{}", config.to_json());
            }
            None => println!("{}", EnrollmentConfig::default().to_json()),
        },
    }

    Ok(())
}

fn load_config(file: Option<&str>) -> anyhow::Result<EnrollmentConfig> {
    let Some(file) = file else {
        return Ok(EnrollmentConfig::default());
    };
    let content = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    EnrollmentConfig::from_json(&content).with_context(|| format!("loading {}", file))
}

async fn get_adapter() -> anyhow::Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or_else(|| anyhow!("No Bluetooth adapter found"))
}

/// The advertised 128-bit service UUID, which is stored little-endian on the air
fn advertised_service_uuid() -> Uuid {
    let mut bytes = ADV_SERVICE_UUID128;
    bytes.reverse();
    Uuid::from_bytes(bytes)
}

/// Company identifier carried in the first two bytes of the manufacturer data
fn advertised_company_id() -> u16 {
    u16::from_le_bytes([ADV_MANUFACTURER_DATA[0], ADV_MANUFACTURER_DATA[1]])
}

async fn scan_collectors(
    adapter: &Adapter,
    config: &EnrollmentConfig,
    duration: u64,
    all: bool,
) -> anyhow::Result<()> {
    println!("Scanning for IRK collectors ({} seconds)...", duration);

    let service_uuid = advertised_service_uuid();
    let company_id = advertised_company_id();

    let mut events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    let mut seen: HashSet<PeripheralId> = HashSet::new();
    let mut found = 0;
    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.next() => {
                let id = match event {
                    Some(CentralEvent::DeviceDiscovered(id)) => id,
                    Some(_) => continue,
                    None => break,
                };
                if !seen.insert(id.clone()) {
                    continue;
                }
                let peripheral = adapter.peripheral(&id).await?;
                let Some(props) = peripheral.properties().await? else {
                    continue;
                };

                let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
                let rssi = props.rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "N/A".to_string());
                let by_name = name == config.device_name;
                let by_service = props.services.contains(&service_uuid)
                    && props.manufacturer_data.contains_key(&company_id);

                if by_name || by_service {
                    found += 1;
                    println!("  {} ({}) RSSI: {} [COLLECTOR]", name, peripheral.address(), rssi);
                } else if all {
                    println!("  {} ({}) RSSI: {}", name, peripheral.address(), rssi);
                }
            }
        }
    }

    adapter.stop_scan().await?;
    println!("\nFound {} collector(s)", found);
    Ok(())
}

/// Random static address, as phones use before handing out their IRK
fn random_peer() -> BdAddr {
    let mut addr: [u8; 6] = rand::random();
    addr[0] |= 0xc0;
    BdAddr(addr)
}

/// Run `pairings` enrollments back to back. Fails as soon as a bond survives a
/// poll or the collector stops advertising.
fn simulate(config: &EnrollmentConfig, pairings: usize, same_irk: bool) -> anyhow::Result<Stats> {
    let stack = SimulatedStack::new();
    let mut collector = IrkEnrollment::new(stack.clone(), config);
    collector.set_latest_irk(|irk: &str| println!("  published IRK: {}", irk));

    collector.setup()?;
    stack.run_until_idle();
    if !stack.is_advertising() {
        return Err(anyhow!("collector did not start advertising"));
    }
    println!("Advertising as '{}'", config.device_name);

    let shared_irk: [u8; 16] = rand::random();
    for n in 1..=pairings {
        let peer = random_peer();
        let irk = if same_irk { shared_irk } else { rand::random() };
        println!("Pairing {} with {}", n, peer);

        stack.connect_peer(peer);
        stack.run_until_idle();
        stack.complete_pairing(peer, irk);
        stack.run_until_idle();

        collector.poll();
        stack.run_until_idle();

        if !stack.bonds().is_empty() {
            return Err(anyhow!("bond for {} survived pairing {}", peer, n));
        }
        if !stack.is_advertising() {
            return Err(anyhow!("collector did not return to advertising after pairing {}", n));
        }
        println!("  bond removed, advertising again");
    }

    println!("\n{}", collector.dump_config());
    Ok(collector.stats())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_identifiers() {
        assert_eq!(advertised_service_uuid(), Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb));
        assert_eq!(advertised_company_id(), 0xffff);
    }

    #[test]
    fn simulated_enrollments_drain_every_bond() {
        let stats = simulate(&EnrollmentConfig::default(), 3, false).unwrap();
        assert_eq!(stats.bonds_drained, 3);
        assert_eq!(stats.irks_published, 3);
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.adv_starts, 4);
    }

    #[test]
    fn repeated_irk_is_published_once() {
        let stats = simulate(&EnrollmentConfig::default(), 3, true).unwrap();
        assert_eq!(stats.bonds_drained, 3);
        assert_eq!(stats.irks_published, 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EnrollmentConfig { device_name: String::new(), ..Default::default() };
        assert!(simulate(&config, 1, false).is_err());
    }

    #[test]
    fn peers_use_static_random_addresses() {
        for _ in 0..16 {
            assert_eq!(random_peer().0[0] & 0xc0, 0xc0);
        }
    }
}
