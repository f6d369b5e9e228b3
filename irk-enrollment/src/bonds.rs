//! Bond registry scanner
//!
//! Runs on every poll. Any bond the stack holds is reported and then torn down,
//! leaving the device ready for the next pairing.

use log::*;

use crate::stack::BleStack;

/// Consumer of the latest harvested IRK (a text sensor, an MQTT topic, ...)
pub trait IrkSink: Send {
    /// Called with the formatted IRK, only when it differs from the previous one
    fn publish(&mut self, irk: &str);
}

impl<F: FnMut(&str) + Send> IrkSink for F {
    fn publish(&mut self, irk: &str) {
        self(irk)
    }
}

/// The latest reported IRK and the sink it is pushed to
#[derive(Default)]
pub struct LatestIrk {
    value: Option<String>,
    sink: Option<Box<dyn IrkSink>>,
}

impl LatestIrk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sink(&mut self, sink: Box<dyn IrkSink>) {
        self.sink = Some(sink);
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Store and publish `irk` if it differs from the held value.
    /// Returns whether anything changed.
    pub fn update(&mut self, irk: String) -> bool {
        if self.value.as_deref() == Some(irk.as_str()) {
            return false;
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.publish(&irk);
        }
        self.value = Some(irk);
        true
    }
}

/// Outcome of one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Bond records found and torn down
    pub drained: usize,
    /// How many of them changed the latest IRK
    pub published: usize,
}

/// Report and remove every bonded device
pub fn scan_and_drain<S: BleStack>(stack: &S, latest: &mut LatestIrk) -> DrainReport {
    let mut report = DrainReport::default();

    let count = match stack.bond_device_count() {
        Ok(count) => count,
        Err(e) => {
            error!("Failed to read bonded device count: {}", e);
            return report;
        }
    };
    if count > 1 {
        warn!("We have {} bonds, where we expect to only ever have 0 or 1", count);
    }
    if count == 0 {
        return report;
    }

    let bonds = match stack.bond_device_list() {
        Ok(bonds) => bonds,
        Err(e) => {
            error!("Failed to read bonded device list: {}", e);
            return report;
        }
    };

    for bond in bonds {
        info!("    remote BD_ADDR: {}", bond.addr);
        let irk = bond.irk_hex();
        info!("      irk: {}", irk);

        if latest.update(irk) {
            report.published += 1;
        }

        // removal goes ahead even if the disconnect was refused
        if let Err(e) = stack.disconnect(bond.addr) {
            warn!("Failed to disconnect {}: {}", bond.addr, e);
        }
        match stack.remove_bond(bond.addr) {
            Ok(()) => info!("  Disconnected and removed bond"),
            Err(e) => warn!("Failed to remove bond for {}: {}", bond.addr, e),
        }
        report.drained += 1;
    }

    report
}
