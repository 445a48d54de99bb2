use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::RwLock;

use crate::error::BridgeError;
use crate::reading::{DeviceIdentity, Reading};
use crate::sink::Sink;

// Newly generated UUID for the power monitor service, no standard type exists.
pub const POWER_MONITOR_SERVICE_TYPE: &str = "0A32858F-6CF9-4354-9B82-438D0261B7E2";
// Eve power consumption characteristic.
pub const CONSUMPTION_CHARACTERISTIC_TYPE: &str = "E863F10D-079E-48FF-8F27-9C2605A29F52";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    UInt16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
}

/// A read-only numeric characteristic published by the accessory.
#[derive(Debug)]
pub struct Characteristic {
    pub type_uuid: &'static str,
    pub format: Format,
    pub permissions: &'static [Permission],
    pub unit: &'static str,
    value: AtomicU16,
}

impl Characteristic {
    fn consumption() -> Self {
        Self {
            type_uuid: CONSUMPTION_CHARACTERISTIC_TYPE,
            format: Format::UInt16,
            permissions: &[Permission::Read],
            unit: "W",
            value: AtomicU16::new(0),
        }
    }

    pub fn value(&self) -> u16 {
        self.value.load(Ordering::Relaxed)
    }

    fn set_value(&self, value: u16) {
        self.value.store(value, Ordering::Relaxed);
    }
}

/// Accessory information fields.
#[derive(Debug)]
pub struct AccessoryInfo {
    pub name: &'static str,
    pub manufacturer: &'static str,
    firmware_revision: RwLock<Option<String>>,
    serial_number: RwLock<Option<String>>,
}

/// In-process state of the "Energy Bridge" sensor accessory.
///
/// The HomeKit transport reads from here; this crate only writes.
#[derive(Debug)]
pub struct PowerAccessory {
    pub info: AccessoryInfo,
    pub service_type: &'static str,
    pub consumption: Characteristic,
}

impl Default for PowerAccessory {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerAccessory {
    pub fn new() -> Self {
        Self {
            info: AccessoryInfo {
                name: "Energy Bridge",
                manufacturer: "Powerley",
                firmware_revision: RwLock::new(None),
                serial_number: RwLock::new(None),
            },
            service_type: POWER_MONITOR_SERVICE_TYPE,
            consumption: Characteristic::consumption(),
        }
    }

    pub fn consumption(&self) -> u16 {
        self.consumption.value()
    }

    pub fn firmware_revision(&self) -> Option<String> {
        self.info
            .firmware_revision
            .read()
            .ok()
            .and_then(|v| v.clone())
    }

    pub fn serial_number(&self) -> Option<String> {
        self.info.serial_number.read().ok().and_then(|v| v.clone())
    }
}

fn set_field(field: &RwLock<Option<String>>, value: &Option<String>) -> Result<(), BridgeError> {
    if value.is_none() {
        return Ok(());
    }
    let mut slot = field.write().map_err(|e| BridgeError::Sink {
        sink: "accessory",
        reason: e.to_string(),
    })?;
    *slot = value.clone();
    Ok(())
}

impl Sink for PowerAccessory {
    fn name(&self) -> &'static str {
        "accessory"
    }

    fn accept(&self, reading: &Reading) -> Result<(), BridgeError> {
        self.consumption.set_value(reading.power_watts);
        Ok(())
    }

    fn identify(&self, identity: &DeviceIdentity) -> Result<(), BridgeError> {
        set_field(&self.info.firmware_revision, &identity.firmware_version)?;
        set_field(&self.info.serial_number, &identity.serial)
    }
}
