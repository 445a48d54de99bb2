//! Keeps the bridge streaming instantaneous demand.
//!
//! The bridge stops publishing demand events once a subscription is older than
//! its TTL, so the scheduler re-subscribes and re-sends the "is app open"
//! probes on a period shorter than that TTL. Renewing is idempotent.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS, SubscribeReasonCode};
use serde_derive::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OPERATION_TIMEOUT;
use crate::error::BridgeError;
use crate::logging::LogConfig;
use crate::source::mqtt::BrokerEvent;

pub const TOPIC_FILTER: &str = "#";

pub const PROBE_TOPICS: [&str; 2] = [
    "_zigbee_metering/request/is_app_open",
    "remote/request/is_app_open",
];

/// The two broker operations a renewal needs. Each resolves only once the
/// broker side of the operation has completed.
#[async_trait]
pub trait SubscriptionClient: Send + Sync {
    async fn request_subscription(&self, filter: &str) -> Result<(), BridgeError>;

    async fn send_probe(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError>;
}

/// Broker client whose requests are confirmed through the events the push
/// source sees on the connection: SUBACKs for subscriptions, and the outgoing
/// PUBLISH for QoS 0 probes.
pub struct BrokerClient {
    client: AsyncClient,
    events: Mutex<mpsc::UnboundedReceiver<BrokerEvent>>,
}

impl BrokerClient {
    pub fn new(client: AsyncClient, events: mpsc::UnboundedReceiver<BrokerEvent>) -> Self {
        Self {
            client,
            events: Mutex::new(events),
        }
    }
}

/// Discards confirmations left over from requests that already timed out.
fn drain_stale(events: &mut mpsc::UnboundedReceiver<BrokerEvent>) {
    while events.try_recv().is_ok() {}
}

#[async_trait]
impl SubscriptionClient for BrokerClient {
    async fn request_subscription(&self, filter: &str) -> Result<(), BridgeError> {
        let mut events = self.events.lock().await;
        drain_stale(&mut events);
        self.client.subscribe(filter, QoS::AtMostOnce).await?;

        let mut pending = None;
        loop {
            match events.recv().await {
                Some(BrokerEvent::SubscribeSent(pkid)) => pending = Some(pkid),
                Some(BrokerEvent::SubAck { pkid, return_codes }) if Some(pkid) == pending => {
                    if return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(BridgeError::SubscriptionRejected {
                            filter: filter.to_string(),
                        });
                    }
                    return Ok(());
                }
                Some(_) => {}
                None => return Err(BridgeError::SessionClosed),
            }
        }
    }

    async fn send_probe(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        let mut events = self.events.lock().await;
        drain_stale(&mut events);
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await?;

        loop {
            match events.recv().await {
                Some(BrokerEvent::PublishSent) => return Ok(()),
                Some(_) => {}
                None => return Err(BridgeError::SessionClosed),
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ProbeRequest {
    request_id: String,
}

fn probe_payload() -> Result<Vec<u8>, BridgeError> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    Ok(serde_json::to_vec(&ProbeRequest {
        request_id: format!("{nanos:x}"),
    })?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    Idle,
    Subscribed,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic_filter: &'static str,
    pub ttl: Duration,
    last_renewed_at: Option<Instant>,
}

impl Subscription {
    fn new(ttl: Duration) -> Self {
        Self {
            topic_filter: TOPIC_FILTER,
            ttl,
            last_renewed_at: None,
        }
    }

    pub fn last_renewed_at(&self) -> Option<Instant> {
        self.last_renewed_at
    }

    fn expire(&mut self) {
        self.last_renewed_at = None;
    }

    pub fn is_live(&self, now: Instant) -> bool {
        self.last_renewed_at
            .is_some_and(|renewed| now.saturating_duration_since(renewed) < self.ttl)
    }
}

pub struct RenewalScheduler<C> {
    client: C,
    subscription: Subscription,
    period: Duration,
    operation_timeout: Duration,
    resubscribe: Option<Arc<Notify>>,
    log: LogConfig,
}

impl<C: SubscriptionClient> RenewalScheduler<C> {
    /// `period` must be strictly shorter than `ttl`.
    pub fn new(
        client: C,
        period: Duration,
        ttl: Duration,
        log: LogConfig,
    ) -> Result<Self, BridgeError> {
        if period.is_zero() || period >= ttl {
            return Err(BridgeError::Config(format!(
                "renewal period {period:?} must be shorter than subscription ttl {ttl:?}"
            )));
        }
        Ok(Self {
            client,
            subscription: Subscription::new(ttl),
            period,
            operation_timeout: OPERATION_TIMEOUT,
            resubscribe: None,
            log,
        })
    }

    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    /// Renew as soon as `signal` fires, e.g. after the broker session was
    /// re-established and lost its subscriptions.
    pub fn with_resubscribe_signal(mut self, signal: Arc<Notify>) -> Self {
        self.resubscribe = Some(signal);
        self
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn state(&self) -> RenewalState {
        match self.subscription.last_renewed_at {
            Some(_) => RenewalState::Subscribed,
            None => RenewalState::Idle,
        }
    }

    /// Subscribes to everything and asks the bridge to start streaming.
    pub async fn renew(&mut self) -> Result<(), BridgeError> {
        if self.log.trace_payloads {
            debug!(filter = TOPIC_FILTER, "renewing subscription to all topics");
        }

        bounded(
            self.operation_timeout,
            "subscribing to MQTT messages",
            self.client.request_subscription(TOPIC_FILTER),
        )
        .await?;

        let payload = probe_payload()?;
        for topic in PROBE_TOPICS {
            bounded(
                self.operation_timeout,
                topic,
                self.client.send_probe(topic, payload.clone()),
            )
            .await?;
        }

        self.subscription.last_renewed_at = Some(Instant::now());
        Ok(())
    }

    /// Renews immediately, then once per period until cancelled. A failed
    /// renewal is retried on the next tick.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(period = ?self.period, ttl = ?self.subscription.ttl, "Starting subscription renewal");

        let mut ticker = interval_at(Instant::now(), self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = resubscribe_requested(&self.resubscribe) => {
                    info!("broker session restarted, renewing subscription now");
                    self.subscription.expire();
                    ticker.reset();
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.renew() => result,
            };
            if let Err(e) = result {
                warn!(error = %e, "Unable to refresh subscription");
            }
        }

        info!("subscription renewal exiting");
    }
}

async fn resubscribe_requested(signal: &Option<Arc<Notify>>) {
    match signal {
        Some(signal) => signal.notified().await,
        None => std::future::pending().await,
    }
}

async fn bounded<F>(limit: Duration, what: &str, operation: F) -> Result<(), BridgeError>
where
    F: Future<Output = Result<(), BridgeError>>,
{
    match timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Timeout(what.to_string())),
    }
}
