//! Fan-out of accepted readings to every registered sink.

pub mod accessory;
pub mod gauge;

use std::sync::Arc;

use tracing::warn;

use crate::error::BridgeError;
use crate::reading::{DeviceIdentity, Reading};

pub use accessory::PowerAccessory;
pub use gauge::PowerGauge;

/// A downstream consumer holding the latest reading for its own export path.
///
/// Implementations store a single value and must never block the caller.
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    fn accept(&self, reading: &Reading) -> Result<(), BridgeError>;

    /// Identity updates from announce messages. Most sinks ignore them.
    fn identify(&self, _identity: &DeviceIdentity) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Delivers each reading to all sinks, isolating their failures.
#[derive(Clone, Default)]
pub struct FanOut {
    sinks: Vec<Arc<dyn Sink>>,
}

impl FanOut {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Returns how many sinks took the reading.
    pub fn dispatch(&self, reading: &Reading) -> usize {
        let mut delivered = 0;
        for sink in &self.sinks {
            match sink.accept(reading) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(sink = sink.name(), error = %e, "sink update failed"),
            }
        }
        delivered
    }

    pub fn identify(&self, identity: &DeviceIdentity) {
        for sink in &self.sinks {
            if let Err(e) = sink.identify(identity) {
                warn!(sink = sink.name(), error = %e, "sink identity update failed");
            }
        }
    }
}
