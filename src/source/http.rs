use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OPERATION_TIMEOUT;
use crate::error::BridgeError;
use crate::logging::LogConfig;
use crate::parser;
use crate::reading::Reading;
use crate::sink::FanOut;

/// Where and how often to poll. Fixed for the life of the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    pub endpoint_url: String,
    pub poll_interval: Duration,
}

/// Timer-driven fetch of the bridge's `"<float> kW"` endpoint.
pub struct HttpSource {
    target: PollTarget,
    client: reqwest::Client,
    log: LogConfig,
}

impl HttpSource {
    pub fn new(target: PollTarget, log: LogConfig) -> Self {
        Self {
            target,
            client: reqwest::Client::new(),
            log,
        }
    }

    pub fn target(&self) -> &PollTarget {
        &self.target
    }

    /// Fetches and parses one reading.
    pub async fn poll_once(&self) -> Result<Reading, BridgeError> {
        let response = self
            .client
            .get(&self.target.endpoint_url)
            .timeout(OPERATION_TIMEOUT)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(BridgeError::Status(response.status()));
        }
        let body = response.bytes().await?;
        if self.log.trace_payloads {
            debug!(url = %self.target.endpoint_url, body = %String::from_utf8_lossy(&body), "poll response");
        }
        Ok(parser::parse_kilowatts(&body)?)
    }

    /// Polls on every tick until cancelled. A failed tick is logged and skipped.
    pub async fn run(self, fan_out: Arc<FanOut>, cancel: CancellationToken) {
        info!(
            url = %self.target.endpoint_url,
            interval = ?self.target.poll_interval,
            "Starting HTTP poll source"
        );

        let mut ticker = interval(self.target.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once() => result,
            };

            match result {
                Ok(reading) => {
                    fan_out.dispatch(&reading);
                }
                Err(e) => warn!(url = %self.target.endpoint_url, error = %e, "skipping poll"),
            }
        }

        info!("HTTP poll source exiting");
    }
}
