use std::env;

use tracing_subscriber::EnvFilter;

pub const DEBUG_ENV_VAR: &str = "HC_DEBUG";

/// Diagnostic verbosity, resolved once at startup and handed to each task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Log every raw inbound payload and every subscription renewal.
    pub trace_payloads: bool,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_value(env::var(DEBUG_ENV_VAR).ok())
    }

    fn from_value(value: Option<String>) -> Self {
        Self {
            trace_payloads: value.is_some_and(|v| !v.is_empty()),
        }
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` wins when set.
pub fn init(log: LogConfig) {
    let default_level = if log.trace_payloads { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
