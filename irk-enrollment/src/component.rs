//! Component lifecycle
//!
//! The host framework calls [`Component::setup`] once after the radio is up and
//! [`Component::poll`] at a fixed cadence afterwards. Stack callbacks reach the
//! shared state through a weak handle captured at registration time.

use std::sync::{Arc, Mutex, Weak};

use log::*;

use crate::advertising::Advertiser;
use crate::bonds::{scan_and_drain, IrkSink, LatestIrk};
use crate::config::EnrollmentConfig;
use crate::error::{ConfigError, Error};
use crate::event::{GapEvent, GattsEvent};
use crate::gatt::{BuildState, GattBuilder, ServicePlan};
use crate::security::SecurityPolicy;
use crate::stack::{BleStack, GattIf};

/// Setup priorities, higher runs earlier
pub mod setup_priority {
    pub const BUS: f32 = 1000.0;
    pub const IO: f32 = 900.0;
    pub const HARDWARE: f32 = 800.0;
    /// After the Bluetooth controller and host stack are initialized
    pub const AFTER_BLUETOOTH: f32 = 700.0;
    pub const DATA: f32 = 600.0;
    pub const LATE: f32 = -100.0;
}

/// Trait for components driven by a host framework
pub trait Component {
    /// Bring the component up. An error marks it failed; it is not polled afterwards.
    fn setup(&mut self) -> Result<(), Error>;

    /// Periodic work. Must not block.
    fn poll(&mut self);

    /// Human readable configuration and status
    fn dump_config(&self) -> String;

    fn setup_priority(&self) -> f32 {
        setup_priority::DATA
    }
}

/// Counters reported by `dump_config`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub bonds_drained: usize,
    pub irks_published: usize,
    pub adv_starts: usize,
    pub connections: usize,
}

/// State shared between stack callbacks and the poll path
pub(crate) struct Enrollment<S: BleStack> {
    pub(crate) stack: S,
    pub(crate) app_id: u16,
    pub(crate) policy: SecurityPolicy,
    pub(crate) builder: GattBuilder,
    pub(crate) advertiser: Advertiser,
    pub(crate) latest: LatestIrk,
    pub(crate) stats: Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Constructed,
    Running,
    Failed,
}

/// Harvests one IRK per pairing: advertise, bond, report, un-bond, repeat
pub struct IrkEnrollment<S: BleStack + Send + 'static> {
    shared: Arc<Mutex<Enrollment<S>>>,
    lifecycle: Lifecycle,
    /// Validation failure found at construction, reported by `setup`
    invalid: Option<ConfigError>,
}

impl<S: BleStack + Send + 'static> IrkEnrollment<S> {
    pub fn new(stack: S, config: &EnrollmentConfig) -> Self {
        let enrollment = Enrollment {
            stack,
            app_id: config.app_id,
            policy: config.security,
            builder: GattBuilder::new(ServicePlan::from_config(config)),
            advertiser: Advertiser::new(&config.device_name, config.advertising.clone()),
            latest: LatestIrk::new(),
            stats: Stats::default(),
        };
        Self {
            shared: Arc::new(Mutex::new(enrollment)),
            lifecycle: Lifecycle::Constructed,
            invalid: config.validate().err(),
        }
    }

    /// Where harvested IRKs are published
    pub fn set_latest_irk(&mut self, sink: impl IrkSink + 'static) {
        if let Ok(mut e) = self.shared.lock() {
            e.latest.set_sink(Box::new(sink));
        }
    }

    pub fn latest_irk(&self) -> Option<String> {
        self.shared.lock().ok()?.latest.value().map(str::to_string)
    }

    pub fn stats(&self) -> Stats {
        self.shared.lock().map(|e| e.stats).unwrap_or_default()
    }

    pub fn gatt_state(&self) -> Option<BuildState> {
        self.shared.lock().ok().map(|e| e.builder.state())
    }

    pub fn is_failed(&self) -> bool {
        self.lifecycle == Lifecycle::Failed
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    fn bring_up(&self) -> Result<(), Error> {
        let e = self.shared.lock().map_err(|_| Error::Poisoned)?;

        info!("Registering BLE callbacks");
        let ctx = Arc::downgrade(&self.shared);
        e.stack
            .register_gap_callback(Box::new(move |event: GapEvent| {
                with_enrollment(&ctx, |e| e.handle_gap_event(event))
            }))
            .map_err(|err| Error::RegisterGapCallback(err.to_string()))?;

        let ctx = Arc::downgrade(&self.shared);
        e.stack
            .register_gatts_callback(Box::new(move |gatts_if: GattIf, event: GattsEvent| {
                with_enrollment(&ctx, |e| e.handle_gatts_event(gatts_if, event))
            }))
            .map_err(|err| Error::RegisterGattsCallback(err.to_string()))?;

        e.policy.apply(&e.stack);

        info!("Registering GATTS app");
        e.stack
            .register_app(e.app_id)
            .map_err(|err| Error::RegisterApp(err.to_string()))?;

        info!("GATT server setup will continue after app registration");
        Ok(())
    }
}

/// Run `f` against the enrollment state if the component is still alive
fn with_enrollment<S: BleStack>(ctx: &Weak<Mutex<Enrollment<S>>>, f: impl FnOnce(&mut Enrollment<S>)) {
    let Some(shared) = ctx.upgrade() else {
        debug!("Event after component was dropped, ignoring");
        return;
    };
    match shared.lock() {
        Ok(mut e) => f(&mut e),
        Err(_) => error!("Enrollment state poisoned, dropping event"),
    };
}

impl<S: BleStack + Send + 'static> Component for IrkEnrollment<S> {
    fn setup(&mut self) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Running => {
                warn!("IRK Enrollment already set up");
                return Ok(());
            }
            Lifecycle::Failed => return Err(Error::Failed),
            Lifecycle::Constructed => {}
        }

        info!("Setting up IRK Enrollment Component");
        let result = match self.invalid.take() {
            Some(err) => Err(Error::Config(err)),
            None => self.bring_up(),
        };
        match result {
            Ok(()) => {
                self.lifecycle = Lifecycle::Running;
                info!("IRK Enrollment Component setup complete");
                Ok(())
            }
            Err(err) => {
                self.lifecycle = Lifecycle::Failed;
                error!("{}", err);
                Err(err)
            }
        }
    }

    fn poll(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        let Ok(mut guard) = self.shared.lock() else {
            error!("Enrollment state poisoned, skipping poll");
            return;
        };
        let Enrollment { stack, latest, stats, .. } = &mut *guard;
        let report = scan_and_drain(stack, latest);
        stats.bonds_drained += report.drained;
        stats.irks_published += report.published;
    }

    fn dump_config(&self) -> String {
        let Ok(e) = self.shared.lock() else {
            return "IRK Enrollment: state unavailable".to_string();
        };
        let mut out = String::from("IRK Enrollment:\n");
        out.push_str(&format!("  Latest IRK: {}\n", e.latest.value().unwrap_or("none")));
        out.push_str(&format!("  Device name: {}\n", e.advertiser.device_name()));
        out.push_str(&format!(
            "  Security: {:?}, io_cap {:?}, max key size {}, encryption {:?}\n",
            e.policy.auth_req, e.policy.io_cap, e.policy.max_key_size, e.policy.encryption
        ));
        let plan = e.builder.plan();
        out.push_str(&format!("  Services: {} then {}\n", plan.primary.name(), plan.secondary.name()));
        out.push_str(&format!("  GATT: {}\n", e.builder.describe()));
        out.push_str(&format!(
            "  Harvested: {} bond(s), {} IRK(s) published, {} connection(s), {} advertising start(s)",
            e.stats.bonds_drained, e.stats.irks_published, e.stats.connections, e.stats.adv_starts
        ));
        if self.is_failed() {
            out.push_str("\n  Status: FAILED");
        }
        out
    }

    fn setup_priority(&self) -> f32 {
        setup_priority::AFTER_BLUETOOTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceOrder;
    use crate::gatt::Stage;
    use crate::sim::{Command, SimulatedStack};
    use crate::stack::{BdAddr, BondRecord, EncryptionLevel};

    const PEER: BdAddr = BdAddr([0x5a, 0x11, 0x22, 0x33, 0x44, 0x55]);

    fn started(config: &EnrollmentConfig) -> (IrkEnrollment<SimulatedStack>, SimulatedStack, Arc<Mutex<Vec<String>>>) {
        let stack = SimulatedStack::new();
        let mut component = IrkEnrollment::new(stack.clone(), config);
        let published = Arc::new(Mutex::new(Vec::new()));
        let log = published.clone();
        component.set_latest_irk(move |irk: &str| log.lock().unwrap().push(irk.to_string()));
        component.setup().unwrap();
        stack.run_until_idle();
        (component, stack, published)
    }

    #[test]
    fn bring_up_ends_advertising() {
        let (component, stack, _) = started(&EnrollmentConfig::default());

        assert!(component.is_running());
        assert_eq!(component.gatt_state(), Some(BuildState::Ready));
        assert!(stack.is_advertising());
        assert_eq!(stack.adv_starts(), 1);

        let services = stack.services();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].id.uuid.as_u16(), Some(0x180A));
        assert_eq!(services[0].characteristics.len(), 2);
        assert_eq!(services[1].id.uuid.as_u16(), Some(0x180D));
        assert_eq!(services[1].characteristics.len(), 1);
        assert!(services.iter().all(|s| s.started));
    }

    #[test]
    fn security_applied_before_app_registration() {
        let (_component, stack, _) = started(&EnrollmentConfig::default());
        let commands = stack.commands();
        let first_param = commands.iter().position(|c| matches!(c, Command::SetSecurityParam(_))).unwrap();
        let register = commands.iter().position(|c| matches!(c, Command::RegisterApp(_))).unwrap();
        assert!(first_param < register);
        assert_eq!(commands[0], Command::RegisterGapCallback);
        assert_eq!(commands[1], Command::RegisterGattsCallback);
    }

    #[test]
    fn harvest_cycle() {
        let (mut component, stack, published) = started(&EnrollmentConfig::default());
        let irk = [0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe, 0, 0, 0, 0, 0, 0, 0, 0x42];

        stack.connect_peer(PEER);
        stack.run_until_idle();
        assert!(stack.commands().contains(&Command::SetEncryption { addr: PEER, level: EncryptionLevel::EncryptMitm }));

        stack.complete_pairing(PEER, irk);
        stack.run_until_idle();
        assert!(stack.commands().contains(&Command::SecurityResponse { addr: PEER, accept: true }));

        let starts_before = stack.adv_starts();
        component.poll();
        assert_eq!(stack.bond_device_count().unwrap(), 0);
        assert!(!stack.is_connected(PEER));

        stack.run_until_idle();
        assert_eq!(stack.adv_starts(), starts_before + 1);
        assert!(stack.is_advertising());

        let expected = "4200000000000000fedcba9876543210";
        assert_eq!(component.latest_irk().as_deref(), Some(expected));
        assert_eq!(*published.lock().unwrap(), vec![expected.to_string()]);

        let stats = component.stats();
        assert_eq!(stats.bonds_drained, 1);
        assert_eq!(stats.irks_published, 1);
        assert_eq!(stats.connections, 1);
    }

    #[test]
    fn disconnect_after_ready_restarts_once() {
        let (_component, stack, _) = started(&EnrollmentConfig::default());
        stack.connect_peer(PEER);
        stack.run_until_idle();
        stack.clear_commands();

        stack.disconnect_peer(PEER);
        stack.run_until_idle();
        assert_eq!(stack.count("start_advertising"), 1);
    }

    #[test]
    fn disconnect_before_ready_does_not_advertise() {
        let stack = SimulatedStack::new();
        stack.fail_service(0x180A);
        let mut component = IrkEnrollment::new(stack.clone(), &EnrollmentConfig::default());
        component.setup().unwrap();
        stack.run_until_idle();
        assert_eq!(component.gatt_state(), Some(BuildState::Requested(Stage::Primary)));

        stack.connect_peer(PEER);
        stack.disconnect_peer(PEER);
        stack.run_until_idle();
        assert_eq!(stack.count("start_advertising"), 0);
    }

    #[test]
    fn secondary_failure_still_advertises() {
        let stack = SimulatedStack::new();
        stack.fail_service(0x180D);
        let mut component = IrkEnrollment::new(stack.clone(), &EnrollmentConfig::default());
        component.setup().unwrap();
        stack.run_until_idle();

        assert_eq!(component.gatt_state(), Some(BuildState::Ready));
        assert!(stack.is_advertising());
        assert_eq!(stack.services().len(), 1);
    }

    #[test]
    fn heart_rate_first_order() {
        let config = EnrollmentConfig { service_order: ServiceOrder::HeartRateFirst, ..Default::default() };
        let (component, stack, _) = started(&config);
        assert_eq!(component.gatt_state(), Some(BuildState::Ready));
        let uuids: Vec<Option<u16>> = stack.services().iter().map(|s| s.id.uuid.as_u16()).collect();
        assert_eq!(uuids, vec![Some(0x180D), Some(0x180A)]);
    }

    #[test]
    fn failed_callback_registration_marks_failed() {
        let stack = SimulatedStack::new();
        stack.fail_command("register_gap_callback");
        let mut component = IrkEnrollment::new(stack.clone(), &EnrollmentConfig::default());

        assert!(matches!(component.setup(), Err(Error::RegisterGapCallback(_))));
        assert!(component.is_failed());
        assert!(matches!(component.setup(), Err(Error::Failed)));

        stack.insert_bond(BondRecord { addr: PEER, irk: [1; 16] });
        stack.clear_commands();
        component.poll();
        assert!(stack.commands().is_empty());
        assert!(component.dump_config().contains("FAILED"));
    }

    #[test]
    fn invalid_config_fails_setup_before_touching_stack() {
        let mut config = EnrollmentConfig::default();
        config.security.max_key_size = 200;
        let stack = SimulatedStack::new();
        let mut component = IrkEnrollment::new(stack.clone(), &config);

        assert!(matches!(component.setup(), Err(Error::Config(ConfigError::KeySize(200)))));
        assert!(component.is_failed());
        assert!(stack.commands().is_empty());
        assert!(matches!(component.setup(), Err(Error::Failed)));
    }

    #[test]
    fn empty_device_name_fails_setup() {
        let config = EnrollmentConfig { device_name: String::new(), ..Default::default() };
        let mut component = IrkEnrollment::new(SimulatedStack::new(), &config);
        assert!(matches!(component.setup(), Err(Error::Config(ConfigError::EmptyDeviceName))));
    }

    #[test]
    fn connect_before_ready_requests_encryption() {
        let stack = SimulatedStack::new();
        stack.fail_service(0x180A);
        let mut component = IrkEnrollment::new(stack.clone(), &EnrollmentConfig::default());
        component.setup().unwrap();
        stack.run_until_idle();
        assert_ne!(component.gatt_state(), Some(BuildState::Ready));

        stack.connect_peer(PEER);
        stack.run_until_idle();
        assert!(stack.commands().contains(&Command::SetEncryption { addr: PEER, level: EncryptionLevel::EncryptMitm }));
        assert_eq!(component.stats().connections, 1);
    }

    #[test]
    fn connect_uses_configured_encryption_level() {
        let config = EnrollmentConfig { security: SecurityPolicy::bond_only(), ..Default::default() };
        let (_component, stack, _) = started(&config);
        stack.connect_peer(PEER);
        stack.run_until_idle();
        assert!(stack.commands().contains(&Command::SetEncryption { addr: PEER, level: EncryptionLevel::EncryptNoMitm }));
    }

    #[test]
    fn failed_app_registration_marks_failed() {
        let stack = SimulatedStack::new();
        stack.fail_command("register_app");
        let mut component = IrkEnrollment::new(stack.clone(), &EnrollmentConfig::default());
        assert!(matches!(component.setup(), Err(Error::RegisterApp(_))));
        assert!(component.is_failed());
    }

    #[test]
    fn setup_is_idempotent() {
        let (mut component, stack, _) = started(&EnrollmentConfig::default());
        stack.clear_commands();
        assert!(component.setup().is_ok());
        assert!(stack.commands().is_empty());
    }

    #[test]
    fn poll_before_setup_does_nothing() {
        let stack = SimulatedStack::new();
        stack.insert_bond(BondRecord { addr: PEER, irk: [1; 16] });
        let mut component = IrkEnrollment::new(stack.clone(), &EnrollmentConfig::default());
        component.poll();
        assert_eq!(stack.bonds().len(), 1);
    }

    #[test]
    fn dropped_component_ignores_events() {
        let stack = SimulatedStack::new();
        let mut component = IrkEnrollment::new(stack.clone(), &EnrollmentConfig::default());
        component.setup().unwrap();
        drop(component);
        stack.run_until_idle();
        assert_eq!(stack.count("create_service"), 0);
    }

    #[test]
    fn dump_config_reports_state() {
        let (mut component, stack, _) = started(&EnrollmentConfig::default());
        stack.insert_bond(BondRecord { addr: PEER, irk: [0xcd; 16] });
        component.poll();

        let dump = component.dump_config();
        assert!(dump.contains(&format!("Latest IRK: {}", "cd".repeat(16))));
        assert!(dump.contains("GATT: ready"));
        assert!(dump.contains("Device Information then Heart Rate"));
        assert_eq!(component.setup_priority(), setup_priority::AFTER_BLUETOOTH);
    }
}
