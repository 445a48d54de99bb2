use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::BridgeError;
use crate::logging::LogConfig;

pub const MQTT_PORT: u16 = 2883;
pub const MQTT_CLIENT_ID: &str = "powerley-energybridge-homecontrol";
const LEGACY_USERNAME: &str = "admin";
const LEGACY_PASSWORD: &str = "trinity";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(250);
pub const TASK_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// Subscribe to the bridge's MQTT broker
    Mqtt,
    /// Poll the bridge's HTTP endpoint
    Http,
}

#[derive(Parser, Debug)]
#[command(name = "energybridge_homecontrol")]
#[command(about = "Exports Powerley Energy Bridge demand readings to HomeKit and Prometheus")]
pub struct Args {
    /// IP address of energy bridge
    #[arg(long, env = "ENERGYBRIDGE_IP", default_value = "")]
    pub ip: String,

    /// Energy bridge firmware generation (1 or 2)
    #[arg(long, env = "ENERGYBRIDGE_VERSION", default_value_t = 2)]
    pub device_version: u8,

    /// Poll interval in seconds (http source only)
    #[arg(long, env = "ENERGYBRIDGE_INTERVAL", default_value_t = 5)]
    pub interval: u64,

    /// Address to listen on for Prometheus exporter
    #[arg(long, env = "ENERGYBRIDGE_ADDR", default_value = ":9525")]
    pub addr: String,

    /// Send authentication information (needed for older firmwares)
    #[arg(long, env = "ENERGYBRIDGE_AUTH")]
    pub auth: bool,

    /// How readings are obtained from the bridge
    #[arg(long, env = "ENERGYBRIDGE_SOURCE", value_enum, default_value_t = SourceKind::Mqtt)]
    pub source: SourceKind,

    /// Seconds between subscription renewals (mqtt source only)
    #[arg(long, env = "ENERGYBRIDGE_RENEW_INTERVAL", default_value_t = 25 * 60)]
    pub renew_interval: u64,

    /// Seconds after which the bridge drops an instantaneous demand subscription
    #[arg(long, env = "ENERGYBRIDGE_SUBSCRIPTION_TTL", default_value_t = 30 * 60)]
    pub subscription_ttl: u64,
}

/// Bridge firmware generation. Only affects the HTTP endpoint shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceVersion {
    V1,
    V2,
}

impl TryFrom<u8> for DeviceVersion {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DeviceVersion::V1),
            2 => Ok(DeviceVersion::V2),
            other => Err(BridgeError::Config(format!(
                "unsupported device version {other}, expected 1 or 2"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub broker_port: u16,
    pub connect_timeout: Duration,
    pub device_version: DeviceVersion,
    pub source: SourceKind,
    pub poll_interval: Duration,
    pub metrics_addr: SocketAddr,
    pub credentials: Option<Credentials>,
    pub renew_interval: Duration,
    pub subscription_ttl: Duration,
    pub log: LogConfig,
}

impl Config {
    pub fn from_args(args: Args, log: LogConfig) -> Result<Self, BridgeError> {
        let host = args.ip.trim().to_string();
        if host.is_empty() {
            return Err(BridgeError::Config("-ip must be provided".to_string()));
        }
        if args.interval == 0 {
            return Err(BridgeError::Config(
                "poll interval must be at least one second".to_string(),
            ));
        }
        if args.renew_interval == 0 || args.renew_interval >= args.subscription_ttl {
            return Err(BridgeError::Config(format!(
                "renew interval ({}s) must be positive and shorter than the subscription ttl ({}s)",
                args.renew_interval, args.subscription_ttl
            )));
        }

        Ok(Self {
            host,
            broker_port: MQTT_PORT,
            connect_timeout: CONNECT_TIMEOUT,
            device_version: DeviceVersion::try_from(args.device_version)?,
            source: args.source,
            poll_interval: Duration::from_secs(args.interval),
            metrics_addr: parse_listen_addr(&args.addr)?,
            credentials: args.auth.then(|| Credentials {
                username: LEGACY_USERNAME.to_string(),
                password: LEGACY_PASSWORD.to_string(),
            }),
            renew_interval: Duration::from_secs(args.renew_interval),
            subscription_ttl: Duration::from_secs(args.subscription_ttl),
            log,
        })
    }

    /// HTTP endpoint serving the `"<float> kW"` body for this firmware generation.
    pub fn poll_url(&self) -> String {
        match self.device_version {
            DeviceVersion::V1 => format!("http://{}/instantaneousdemand", self.host),
            DeviceVersion::V2 => format!(
                "http://{}:8888/zigbee/se/instantaneousdemand",
                self.host
            ),
        }
    }
}

/// Accepts Go-style `:port` shorthand for "all interfaces".
fn parse_listen_addr(addr: &str) -> Result<SocketAddr, BridgeError> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| BridgeError::Config(format!("invalid listen address {addr:?}: {e}")))
}
