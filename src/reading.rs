use std::time::Instant;

/// Identity fields the bridge reports in its announce messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: Option<String>,
    pub firmware_version: Option<String>,
}

impl DeviceIdentity {
    /// Takes every field `update` carries, keeping the ones it leaves out.
    pub fn merge(&mut self, update: &DeviceIdentity) {
        if update.serial.is_some() {
            self.serial = update.serial.clone();
        }
        if update.firmware_version.is_some() {
            self.firmware_version = update.firmware_version.clone();
        }
    }
}

/// A single normalized instantaneous demand sample.
///
/// Readings are produced by the parser and handed straight to the fan-out,
/// they are never buffered. `identity` is whatever the bridge last announced,
/// empty for the HTTP source.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub power_watts: u16,
    pub identity: DeviceIdentity,
    pub observed_at: Instant,
}

impl Reading {
    pub fn new(power_watts: u16) -> Self {
        Self {
            power_watts,
            identity: DeviceIdentity::default(),
            observed_at: Instant::now(),
        }
    }

    pub fn with_identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = identity;
        self
    }
}

/// Decoded content of one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Announce(DeviceIdentity),
    Demand(Reading),
}
