//! IRK Enrollment
//!
//! Turns a BLE-capable MCU into a collector of Identity Resolving Keys. The
//! device advertises as a connectable peripheral, accepts pairing from any
//! central, reports the IRK the central distributed and forgets the bond so the
//! next device can enroll.
//!
//! This crate holds the stack-independent logic. MCU crates implement
//! [`BleStack`] over their BLE host (see `irk-esp32` for Bluedroid); tests and
//! the `irk-ble simulate` command use [`sim::SimulatedStack`].

pub mod advertising;
pub mod bonds;
pub mod component;
pub mod config;
mod dispatch;
pub mod error;
pub mod event;
pub mod gatt;
pub mod key;
pub mod security;
pub mod sim;
pub mod stack;

pub use bonds::{IrkSink, LatestIrk};
pub use component::{Component, IrkEnrollment, Stats};
pub use config::{AdvertisingConfig, EnrollmentConfig, ServiceOrder};
pub use error::{ConfigError, Error};
pub use event::{GapEvent, GattsEvent, Status};
pub use key::{format_irk, format_key};
pub use security::SecurityPolicy;
pub use stack::*;
