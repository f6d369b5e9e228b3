//! GATT service builder
//!
//! Creates two services, one after the other, driven purely by completion
//! events. Every step issues a command and returns; the next step runs when the
//! stack reports back.
//!
//! ```text
//! Idle -> AppRegistered -> Requested(Primary) -> Created(Primary) -> Started(Primary)
//!      -> Requested(Secondary) -> Created(Secondary) -> Started(Secondary) -> Ready
//! ```
//!
//! The primary service is required. Anything going wrong with the secondary
//! still ends in `Ready`, so advertising starts with whatever was built.

use std::fmt;

use irk_proto::{
    DEVICE_INFORMATION_SERVICE, HEART_RATE_MEASUREMENT_CHAR, HEART_RATE_MEASUREMENT_VALUE,
    HEART_RATE_SERVICE, MANUFACTURER_NAME_CHAR, MODEL_NUMBER_CHAR, SERVICE_NUM_HANDLES,
};
use log::*;

use crate::config::{EnrollmentConfig, ServiceOrder};
use crate::event::Status;
use crate::stack::{BleStack, BtUuid, Characteristic, GattIf, Permissions, Properties, ServiceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    AppRegistered,
    Requested(Stage),
    Created(Stage),
    Started(Stage),
    Ready,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = |s: &Stage| match s {
            Stage::Primary => "primary",
            Stage::Secondary => "secondary",
        };
        match self {
            BuildState::Idle => f.write_str("idle"),
            BuildState::AppRegistered => f.write_str("app registered"),
            BuildState::Requested(s) => write!(f, "{} requested", stage(s)),
            BuildState::Created(s) => write!(f, "{} created", stage(s)),
            BuildState::Started(s) => write!(f, "{} started", stage(s)),
            BuildState::Ready => f.write_str("ready"),
        }
    }
}

/// A service and the static characteristics it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub uuid: u16,
    pub characteristics: Vec<Characteristic>,
}

impl ServiceSpec {
    /// Device Information (0x180A): Manufacturer Name and Model Number
    pub fn device_information(manufacturer: &str, model: &str) -> Self {
        Self {
            uuid: DEVICE_INFORMATION_SERVICE,
            characteristics: vec![
                Characteristic {
                    uuid: BtUuid::Uuid16(MANUFACTURER_NAME_CHAR),
                    permissions: Permissions::READ,
                    properties: Properties::READ,
                    value: manufacturer.as_bytes().to_vec(),
                },
                Characteristic {
                    uuid: BtUuid::Uuid16(MODEL_NUMBER_CHAR),
                    permissions: Permissions::READ,
                    properties: Properties::READ,
                    value: model.as_bytes().to_vec(),
                },
            ],
        }
    }

    /// Heart Rate (0x180D) with a static measurement. Only there so phones
    /// recognise the device; the value never changes.
    pub fn heart_rate() -> Self {
        Self {
            uuid: HEART_RATE_SERVICE,
            characteristics: vec![Characteristic {
                uuid: BtUuid::Uuid16(HEART_RATE_MEASUREMENT_CHAR),
                permissions: Permissions::READ,
                properties: Properties::READ_NOTIFY,
                value: HEART_RATE_MEASUREMENT_VALUE.to_vec(),
            }],
        }
    }

    pub fn name(&self) -> &'static str {
        irk_proto::uuid16_name(self.uuid).unwrap_or("custom")
    }
}

/// The two services, in creation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePlan {
    pub primary: ServiceSpec,
    pub secondary: ServiceSpec,
}

impl ServicePlan {
    pub fn from_config(config: &EnrollmentConfig) -> Self {
        let device_info = ServiceSpec::device_information(&config.manufacturer, &config.model);
        let heart_rate = ServiceSpec::heart_rate();
        match config.service_order {
            ServiceOrder::DeviceInfoFirst => Self { primary: device_info, secondary: heart_rate },
            ServiceOrder::HeartRateFirst => Self { primary: heart_rate, secondary: device_info },
        }
    }

    fn spec(&self, stage: Stage) -> &ServiceSpec {
        match stage {
            Stage::Primary => &self.primary,
            Stage::Secondary => &self.secondary,
        }
    }
}

/// Completion inputs the builder reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildInput {
    AppRegistered { status: Status, gatts_if: GattIf },
    ServiceCreated { status: Status, service_handle: u16, uuid: BtUuid },
}

/// What an input did to the builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Advanced,
    /// Bring-up is complete; advertising should start
    BecameReady,
}

pub struct GattBuilder {
    plan: ServicePlan,
    state: BuildState,
    gatts_if: Option<GattIf>,
    primary_handle: Option<u16>,
    secondary_handle: Option<u16>,
    secondary_requested: bool,
    history: Vec<BuildState>,
}

impl GattBuilder {
    pub fn new(plan: ServicePlan) -> Self {
        Self {
            plan,
            state: BuildState::Idle,
            gatts_if: None,
            primary_handle: None,
            secondary_handle: None,
            secondary_requested: false,
            history: vec![BuildState::Idle],
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == BuildState::Ready
    }

    pub fn plan(&self) -> &ServicePlan {
        &self.plan
    }

    pub fn gatts_if(&self) -> Option<GattIf> {
        self.gatts_if
    }

    pub fn primary_handle(&self) -> Option<u16> {
        self.primary_handle
    }

    pub fn secondary_handle(&self) -> Option<u16> {
        self.secondary_handle
    }

    /// Every state entered so far, starting with `Idle`
    pub fn history(&self) -> &[BuildState] {
        &self.history
    }

    /// Current state in terms of the configured services, e.g. "Heart Rate requested"
    pub fn describe(&self) -> String {
        match self.state {
            BuildState::Requested(s) => format!("{} requested", self.plan.spec(s).name()),
            BuildState::Created(s) => format!("{} created", self.plan.spec(s).name()),
            BuildState::Started(s) => format!("{} started", self.plan.spec(s).name()),
            other => other.to_string(),
        }
    }

    pub fn on_input<S: BleStack>(&mut self, stack: &S, input: BuildInput) -> Transition {
        if self.is_ready() {
            debug!("GATT bring-up already complete, ignoring {:?}", input);
            return Transition::Unchanged;
        }

        let before = self.state;
        match input {
            BuildInput::AppRegistered { status, gatts_if } => {
                self.on_app_registered(stack, status, gatts_if)
            }
            BuildInput::ServiceCreated { status, service_handle, uuid } => {
                match self.stage_of(uuid) {
                    Some(Stage::Primary) => self.on_primary_created(stack, status, service_handle),
                    Some(Stage::Secondary) => self.on_secondary_created(stack, status, service_handle),
                    None => warn!("Ignoring creation of unexpected service {}", uuid),
                }
            }
        }

        if self.state == before {
            Transition::Unchanged
        } else if self.is_ready() {
            Transition::BecameReady
        } else {
            Transition::Advanced
        }
    }

    fn enter(&mut self, state: BuildState) {
        debug!("GATT: {} -> {}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    fn stage_of(&self, uuid: BtUuid) -> Option<Stage> {
        let uuid = uuid.as_u16()?;
        if uuid == self.plan.primary.uuid {
            Some(Stage::Primary)
        } else if uuid == self.plan.secondary.uuid {
            Some(Stage::Secondary)
        } else {
            None
        }
    }

    fn on_app_registered<S: BleStack>(&mut self, stack: &S, status: Status, gatts_if: GattIf) {
        info!("GATTS app registered with status: {}", status);
        if self.state != BuildState::Idle {
            warn!("Duplicate app registration event in state {}, ignoring", self.state);
            return;
        }
        if !status.is_ok() {
            error!("GATTS app registration failed: {}", status);
            return;
        }

        self.gatts_if = Some(gatts_if);
        self.enter(BuildState::AppRegistered);

        let (name, uuid) = (self.plan.primary.name(), self.plan.primary.uuid);
        match stack.create_service(gatts_if, &ServiceId::primary16(uuid), SERVICE_NUM_HANDLES) {
            Ok(()) => {
                info!("{} service creation initiated", name);
                self.enter(BuildState::Requested(Stage::Primary));
            }
            Err(e) => error!("Failed to create {} service: {}", name, e),
        }
    }

    fn on_primary_created<S: BleStack>(&mut self, stack: &S, status: Status, handle: u16) {
        let name = self.plan.primary.name();
        info!("{} service created with status: {}", name, status);
        if self.state != BuildState::Requested(Stage::Primary) {
            warn!("Unexpected {} creation event in state {}, ignoring", name, self.state);
            return;
        }
        if !status.is_ok() {
            error!("{} service creation failed, bring-up halted", name);
            return;
        }

        self.primary_handle = Some(handle);
        self.enter(BuildState::Created(Stage::Primary));
        if self.start_with_characteristics(stack, Stage::Primary, handle) {
            self.enter(BuildState::Started(Stage::Primary));
        }

        if !self.secondary_requested {
            self.secondary_requested = true;
            self.request_secondary(stack);
        }
    }

    fn request_secondary<S: BleStack>(&mut self, stack: &S) {
        let Some(gatts_if) = self.gatts_if else {
            return;
        };
        let (name, uuid) = (self.plan.secondary.name(), self.plan.secondary.uuid);
        match stack.create_service(gatts_if, &ServiceId::primary16(uuid), SERVICE_NUM_HANDLES) {
            Ok(()) => {
                info!("{} service creation initiated", name);
                self.enter(BuildState::Requested(Stage::Secondary));
            }
            Err(e) => {
                error!("Failed to create {} service: {}", name, e);
                // advertise with the primary service alone
                self.enter(BuildState::Ready);
            }
        }
    }

    fn on_secondary_created<S: BleStack>(&mut self, stack: &S, status: Status, handle: u16) {
        let name = self.plan.secondary.name();
        info!("{} service created with status: {}", name, status);
        if self.state != BuildState::Requested(Stage::Secondary) {
            warn!("Unexpected {} creation event in state {}, ignoring", name, self.state);
            return;
        }
        if !status.is_ok() {
            warn!("{} service creation failed, continuing without it", name);
            self.enter(BuildState::Ready);
            return;
        }

        self.secondary_handle = Some(handle);
        self.enter(BuildState::Created(Stage::Secondary));
        if self.start_with_characteristics(stack, Stage::Secondary, handle) {
            self.enter(BuildState::Started(Stage::Secondary));
        }
        self.enter(BuildState::Ready);
    }

    /// Start a created service and add its characteristics. Returns false if
    /// the start command failed, in which case no characteristics are added.
    fn start_with_characteristics<S: BleStack>(&self, stack: &S, stage: Stage, handle: u16) -> bool {
        let spec = self.plan.spec(stage);
        info!("{} service handle: {}", spec.name(), handle);

        if let Err(e) = stack.start_service(handle) {
            error!("Failed to start {} service: {}", spec.name(), e);
            return false;
        }
        info!("{} service started", spec.name());

        for characteristic in &spec.characteristics {
            let label = characteristic
                .uuid
                .as_u16()
                .and_then(irk_proto::uuid16_name)
                .unwrap_or("custom");
            match stack.add_characteristic(handle, characteristic) {
                Ok(()) => info!("{} characteristic added", label),
                Err(e) => error!("Failed to add {} characteristic: {}", label, e),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Command, SimulatedStack, SIM_GATTS_IF};

    fn builder() -> GattBuilder {
        GattBuilder::new(ServicePlan::from_config(&EnrollmentConfig::default()))
    }

    fn registered() -> BuildInput {
        BuildInput::AppRegistered { status: Status::Ok, gatts_if: SIM_GATTS_IF }
    }

    fn created(uuid: u16, handle: u16) -> BuildInput {
        BuildInput::ServiceCreated { status: Status::Ok, service_handle: handle, uuid: BtUuid::Uuid16(uuid) }
    }

    #[test]
    fn full_sequence_reaches_ready() {
        let stack = SimulatedStack::new();
        let mut b = builder();

        assert_eq!(b.on_input(&stack, registered()), Transition::Advanced);
        assert_eq!(b.state(), BuildState::Requested(Stage::Primary));
        assert_eq!(b.describe(), "Device Information requested");

        assert_eq!(b.on_input(&stack, created(0x180A, 40)), Transition::Advanced);
        assert_eq!(b.state(), BuildState::Requested(Stage::Secondary));
        assert_eq!(b.primary_handle(), Some(40));

        assert_eq!(b.on_input(&stack, created(0x180D, 50)), Transition::BecameReady);
        assert!(b.is_ready());
        assert_eq!(
            b.history(),
            &[
                BuildState::Idle,
                BuildState::AppRegistered,
                BuildState::Requested(Stage::Primary),
                BuildState::Created(Stage::Primary),
                BuildState::Started(Stage::Primary),
                BuildState::Requested(Stage::Secondary),
                BuildState::Created(Stage::Secondary),
                BuildState::Started(Stage::Secondary),
                BuildState::Ready,
            ]
        );

        assert_eq!(stack.count("create_service"), 2);
        assert_eq!(stack.count("start_service"), 2);
        assert_eq!(stack.count("add_characteristic"), 3);
    }

    #[test]
    fn device_info_characteristics() {
        let stack = SimulatedStack::new();
        let mut b = builder();
        b.on_input(&stack, registered());
        b.on_input(&stack, created(0x180A, 40));

        let chars: Vec<Characteristic> = stack
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::AddCharacteristic { service_handle: 40, characteristic } => Some(characteristic),
                _ => None,
            })
            .collect();
        assert_eq!(chars.len(), 2);
        assert_eq!(chars[0].uuid, BtUuid::Uuid16(0x2A29));
        assert_eq!(chars[0].value, b"IRK Harvest");
        assert_eq!(chars[1].uuid, BtUuid::Uuid16(0x2A24));
        assert_eq!(chars[1].value, b"IRK Collector");
        assert!(chars.iter().all(|c| c.properties == Properties::READ));
    }

    #[test]
    fn secondary_requested_once() {
        let stack = SimulatedStack::new();
        let mut b = builder();
        b.on_input(&stack, registered());
        b.on_input(&stack, created(0x180A, 40));
        assert_eq!(b.on_input(&stack, created(0x180A, 60)), Transition::Unchanged);
        assert_eq!(stack.count("create_service"), 2);
    }

    #[test]
    fn secondary_failed_status_still_ready() {
        let stack = SimulatedStack::new();
        let mut b = builder();
        b.on_input(&stack, registered());
        b.on_input(&stack, created(0x180A, 40));
        let failed = BuildInput::ServiceCreated {
            status: Status::Failed(0x85),
            service_handle: 0,
            uuid: BtUuid::Uuid16(0x180D),
        };
        assert_eq!(b.on_input(&stack, failed), Transition::BecameReady);
        assert_eq!(b.secondary_handle(), None);
    }

    #[test]
    fn secondary_create_call_failure_still_ready() {
        let stack = SimulatedStack::new();
        let mut b = builder();
        b.on_input(&stack, registered());
        stack.fail_command("create_service");
        assert_eq!(b.on_input(&stack, created(0x180A, 40)), Transition::BecameReady);
    }

    #[test]
    fn secondary_start_failure_still_ready() {
        let stack = SimulatedStack::new();
        let mut b = builder();
        b.on_input(&stack, registered());
        b.on_input(&stack, created(0x180A, 40));
        stack.fail_command("start_service");
        assert_eq!(b.on_input(&stack, created(0x180D, 50)), Transition::BecameReady);
        assert!(!b.history().contains(&BuildState::Started(Stage::Secondary)));
    }

    #[test]
    fn primary_failure_stalls() {
        let stack = SimulatedStack::new();
        let mut b = builder();
        b.on_input(&stack, registered());
        let failed = BuildInput::ServiceCreated {
            status: Status::Failed(0x85),
            service_handle: 0,
            uuid: BtUuid::Uuid16(0x180A),
        };
        assert_eq!(b.on_input(&stack, failed), Transition::Unchanged);
        assert_eq!(b.state(), BuildState::Requested(Stage::Primary));
        assert_eq!(stack.count("create_service"), 1);
    }

    #[test]
    fn registration_failure_stays_idle() {
        let stack = SimulatedStack::new();
        let mut b = builder();
        let failed = BuildInput::AppRegistered { status: Status::Failed(1), gatts_if: 0xff };
        assert_eq!(b.on_input(&stack, failed), Transition::Unchanged);
        assert_eq!(b.state(), BuildState::Idle);
        assert!(stack.commands().is_empty());
    }

    #[test]
    fn out_of_order_creation_is_ignored() {
        let stack = SimulatedStack::new();
        let mut b = builder();
        b.on_input(&stack, registered());
        assert_eq!(b.on_input(&stack, created(0x180D, 50)), Transition::Unchanged);
        assert_eq!(b.on_input(&stack, created(0x1234, 50)), Transition::Unchanged);
        assert_eq!(b.state(), BuildState::Requested(Stage::Primary));
    }

    #[test]
    fn inputs_after_ready_are_ignored() {
        let stack = SimulatedStack::new();
        let mut b = builder();
        b.on_input(&stack, registered());
        b.on_input(&stack, created(0x180A, 40));
        b.on_input(&stack, created(0x180D, 50));
        stack.clear_commands();
        assert_eq!(b.on_input(&stack, registered()), Transition::Unchanged);
        assert!(stack.commands().is_empty());
    }

    #[test]
    fn heart_rate_first() {
        let config = EnrollmentConfig { service_order: ServiceOrder::HeartRateFirst, ..Default::default() };
        let stack = SimulatedStack::new();
        let mut b = GattBuilder::new(ServicePlan::from_config(&config));
        b.on_input(&stack, registered());
        assert_eq!(b.describe(), "Heart Rate requested");
        b.on_input(&stack, created(0x180D, 40));
        assert_eq!(b.on_input(&stack, created(0x180A, 50)), Transition::BecameReady);
        assert_eq!(b.primary_handle(), Some(40));
        assert_eq!(b.secondary_handle(), Some(50));
    }
}
