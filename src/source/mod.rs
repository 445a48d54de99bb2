//! Acquisition strategies. Both produce readings into a [`FanOut`] until
//! cancelled.

pub mod http;
pub mod mqtt;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::DISCONNECT_GRACE;
use crate::sink::FanOut;

pub use http::{HttpSource, PollTarget};
pub use mqtt::MqttSource;

pub enum Source {
    /// Long-lived broker subscription.
    Push(MqttSource),
    /// Periodic HTTP fetch.
    Pull(HttpSource),
}

impl Source {
    pub fn kind(&self) -> &'static str {
        match self {
            Source::Push(_) => "mqtt",
            Source::Pull(_) => "http",
        }
    }

    pub async fn run(self, fan_out: Arc<FanOut>, cancel: CancellationToken) {
        match self {
            Source::Push(source) => source.run(fan_out, cancel, DISCONNECT_GRACE).await,
            Source::Pull(source) => source.run(fan_out, cancel).await,
        }
    }
}
