//! Energy Bridge Home Control Library
//!
//! Bridges a Powerley Energy Bridge's instantaneous demand readings, pushed over
//! MQTT or polled over HTTP, into a HomeKit accessory characteristic and a
//! Prometheus gauge.

pub mod config;
pub mod error;
pub mod exporter;
pub mod lifecycle;
pub mod logging;
pub mod parser;
pub mod reading;
pub mod renewal;
pub mod sink;
pub mod source;

// Re-export commonly used types for easier access
pub use config::{Args, Config, SourceKind};
pub use error::{BridgeError, ParseError};
pub use lifecycle::{Controller, Running};
pub use reading::{DeviceIdentity, Reading};
pub use sink::{FanOut, PowerAccessory, PowerGauge, Sink};
pub use source::Source;
