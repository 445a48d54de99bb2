use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::BridgeError;
use crate::reading::Reading;
use crate::sink::Sink;

pub const DEMAND_GAUGE_NAME: &str = "powerley_energybridge_instantaneous_demand_watts";
const DEMAND_GAUGE_HELP: &str = "Current power demand in watts.";

/// Last-value gauge of power demand, exported at `/metrics`.
#[derive(Debug)]
pub struct PowerGauge {
    // f64 stored as its bit pattern
    watts: AtomicU64,
}

impl Default for PowerGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerGauge {
    pub fn new() -> Self {
        Self {
            watts: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.watts.load(Ordering::Relaxed))
    }

    fn set(&self, watts: f64) {
        self.watts.store(watts.to_bits(), Ordering::Relaxed);
    }

    /// Renders the gauge in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "# HELP {DEMAND_GAUGE_NAME} {DEMAND_GAUGE_HELP}");
        let _ = writeln!(output, "# TYPE {DEMAND_GAUGE_NAME} gauge");
        let _ = writeln!(output, "{DEMAND_GAUGE_NAME} {}", self.value());
        output
    }
}

impl Sink for PowerGauge {
    fn name(&self) -> &'static str {
        "gauge"
    }

    fn accept(&self, reading: &Reading) -> Result<(), BridgeError> {
        self.set(f64::from(reading.power_watts));
        Ok(())
    }
}
