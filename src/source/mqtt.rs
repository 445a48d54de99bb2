use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Credentials, MQTT_CLIENT_ID};
use crate::error::BridgeError;
use crate::logging::LogConfig;
use crate::parser;
use crate::reading::{DeviceIdentity, Message};
use crate::renewal::BrokerClient;
use crate::sink::FanOut;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 10;

/// Connection events the renewal side waits on to confirm its requests.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    SubscribeSent(u16),
    SubAck {
        pkid: u16,
        return_codes: Vec<SubscribeReasonCode>,
    },
    PublishSent,
}

pub fn build_options(host: &str, port: u16, credentials: &Option<Credentials>) -> MqttOptions {
    let mut opts = MqttOptions::new(MQTT_CLIENT_ID, host, port);
    opts.set_keep_alive(KEEP_ALIVE);
    if let Some(c) = credentials {
        opts.set_credentials(c.username.clone(), c.password.clone());
    }
    opts
}

/// Connects to the bridge's broker, waiting at most `connect_timeout` for the
/// CONNACK. Failure here is fatal to startup.
pub async fn connect(
    options: MqttOptions,
    connect_timeout: Duration,
    log: LogConfig,
) -> Result<(BrokerClient, MqttSource), BridgeError> {
    let (host, port) = options.broker_address();
    let broker = format!("{host}:{port}");
    let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

    match timeout(connect_timeout, wait_for_connack(&mut event_loop)).await {
        Err(_) => Err(BridgeError::ConnectTimeout(broker)),
        Ok(Err(source)) => Err(BridgeError::Connect {
            host: broker,
            source,
        }),
        Ok(Ok(())) => {
            info!(%broker, "connected to energy bridge broker");
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Ok((
                BrokerClient::new(client.clone(), events_rx),
                MqttSource {
                    client,
                    event_loop,
                    events: events_tx,
                    reconnected: Arc::new(Notify::new()),
                    log,
                },
            ))
        }
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = event_loop.poll().await? {
            return Ok(());
        }
    }
}

/// Receive side of the broker connection.
pub struct MqttSource {
    client: AsyncClient,
    event_loop: EventLoop,
    events: mpsc::UnboundedSender<BrokerEvent>,
    reconnected: Arc<Notify>,
    log: LogConfig,
}

impl MqttSource {
    /// Fires each time the session is re-established after a connection
    /// error. The broker starts such sessions with no subscriptions.
    pub fn resubscribe_signal(&self) -> Arc<Notify> {
        self.reconnected.clone()
    }

    /// Drives the event loop until cancelled, then disconnects within
    /// `disconnect_grace`.
    pub async fn run(
        mut self,
        fan_out: Arc<FanOut>,
        cancel: CancellationToken,
        disconnect_grace: Duration,
    ) {
        info!("Starting MQTT source");
        let mut identity = DeviceIdentity::default();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_message(
                        &publish.topic,
                        &publish.payload,
                        &fan_out,
                        &mut identity,
                        self.log,
                    );
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("reconnected to broker, requesting a fresh subscription");
                    self.reconnected.notify_one();
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => self.forward(BrokerEvent::SubAck {
                    pkid: ack.pkid,
                    return_codes: ack.return_codes,
                }),
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    self.forward(BrokerEvent::SubscribeSent(pkid))
                }
                Ok(Event::Outgoing(Outgoing::Publish(_))) => self.forward(BrokerEvent::PublishSent),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error; reconnecting after short delay");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        self.disconnect(disconnect_grace).await;
        info!("MQTT source exiting");
    }

    fn forward(&self, event: BrokerEvent) {
        if self.events.send(event).is_err() && self.log.trace_payloads {
            debug!("no renewal listening for broker confirmations");
        }
    }

    async fn disconnect(&mut self, grace: Duration) {
        if let Err(e) = self.client.try_disconnect() {
            warn!(error = %e, "unable to request MQTT disconnect");
            return;
        }
        let flushed = timeout(grace, async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!(?grace, "MQTT disconnect did not complete within grace period");
        }
    }
}

/// Routes one inbound message by topic. Bad payloads are logged and dropped.
///
/// `identity` accumulates announce fields and is attached to every demand
/// reading that follows.
pub fn handle_message(
    topic: &str,
    payload: &[u8],
    fan_out: &FanOut,
    identity: &mut DeviceIdentity,
    log: LogConfig,
) {
    if log.trace_payloads {
        debug!(topic, payload = %String::from_utf8_lossy(payload), "message received");
    }

    match parser::decode(topic, payload) {
        Ok(Some(Message::Demand(reading))) => {
            fan_out.dispatch(&reading.with_identity(identity.clone()));
        }
        Ok(Some(Message::Announce(update))) => {
            identity.merge(&update);
            fan_out.identify(&update);
        }
        Ok(None) => {}
        Err(e) => warn!(topic, error = %e, "unable to decode message payload"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MQTT_PORT;
    use crate::reading::Reading;
    use crate::renewal::{RenewalScheduler, RenewalState};
    use crate::sink::{PowerAccessory, PowerGauge, Sink};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn sinks() -> (Arc<PowerAccessory>, Arc<PowerGauge>, FanOut) {
        let accessory = Arc::new(PowerAccessory::new());
        let gauge = Arc::new(PowerGauge::new());
        let fan_out = FanOut::default()
            .with_sink(accessory.clone())
            .with_sink(gauge.clone());
        (accessory, gauge, fan_out)
    }

    #[test]
    fn test_demand_message_updates_both_sinks() {
        let (accessory, gauge, fan_out) = sinks();
        let mut identity = DeviceIdentity::default();
        handle_message(
            "event/metering/instantaneous_demand",
            br#"{"demand": 842}"#,
            &fan_out,
            &mut identity,
            LogConfig::default(),
        );
        assert_eq!(accessory.consumption(), 842);
        assert_eq!(gauge.value(), 842.0);

        handle_message(
            "_zigbee_metering/event/metering/instantaneous_demand",
            br#"{"demand": 1200}"#,
            &fan_out,
            &mut identity,
            LogConfig::default(),
        );
        assert_eq!(accessory.consumption(), 1200);
        assert_eq!(gauge.value(), 1200.0);
    }

    #[test]
    fn test_announce_updates_identity_only() {
        let (accessory, gauge, fan_out) = sinks();
        fan_out.dispatch(&Reading::new(500));
        let mut identity = DeviceIdentity::default();

        handle_message(
            "announce",
            br#"{"eb_os_version":"3.2","serial":"ABC123"}"#,
            &fan_out,
            &mut identity,
            LogConfig::default(),
        );

        assert_eq!(accessory.firmware_revision().as_deref(), Some("3.2"));
        assert_eq!(accessory.serial_number().as_deref(), Some("ABC123"));
        assert_eq!(accessory.consumption(), 500);
        assert_eq!(gauge.value(), 500.0);
    }

    /// Keeps the last reading it was handed.
    #[derive(Default)]
    struct LastReading(std::sync::Mutex<Option<Reading>>);

    impl Sink for LastReading {
        fn name(&self) -> &'static str {
            "last"
        }

        fn accept(&self, reading: &Reading) -> Result<(), BridgeError> {
            *self.0.lock().unwrap() = Some(reading.clone());
            Ok(())
        }
    }

    #[test]
    fn test_demand_carries_announced_identity() {
        let last = Arc::new(LastReading::default());
        let fan_out = FanOut::default().with_sink(last.clone());
        let mut identity = DeviceIdentity::default();
        let demand = "event/metering/instantaneous_demand";

        let log = LogConfig::default();

        handle_message(demand, br#"{"demand": 100}"#, &fan_out, &mut identity, log);
        let first = last.0.lock().unwrap().clone().unwrap();
        assert_eq!(first.identity, DeviceIdentity::default());

        handle_message(
            "announce",
            br#"{"eb_os_version":"3.2","serial":"ABC123"}"#,
            &fan_out,
            &mut identity,
            log,
        );
        handle_message("announce", br#"{"eb_os_version":"3.3"}"#, &fan_out, &mut identity, log);
        handle_message(demand, br#"{"demand": 842}"#, &fan_out, &mut identity, log);

        let reading = last.0.lock().unwrap().clone().unwrap();
        assert_eq!(reading.power_watts, 842);
        assert_eq!(reading.identity.serial.as_deref(), Some("ABC123"));
        assert_eq!(reading.identity.firmware_version.as_deref(), Some("3.3"));
    }

    #[test]
    fn test_malformed_and_unknown_messages_are_dropped() {
        let (accessory, gauge, fan_out) = sinks();
        accessory.accept(&Reading::new(10)).unwrap();
        gauge.accept(&Reading::new(10)).unwrap();

        let log = LogConfig {
            trace_payloads: true,
        };
        let mut identity = DeviceIdentity::default();
        for (topic, payload) in [
            ("event/metering/instantaneous_demand", &b"{oops"[..]),
            ("announce", &b"not json"[..]),
            ("remote/request/is_app_open", &br#"{"demand": 1}"#[..]),
        ] {
            handle_message(topic, payload, &fan_out, &mut identity, log);
        }
        assert_eq!(identity, DeviceIdentity::default());

        assert_eq!(accessory.consumption(), 10);
        assert_eq!(gauge.value(), 10.0);
        assert_eq!(accessory.serial_number(), None);
    }

    #[test]
    fn test_build_options() {
        let opts = build_options("10.0.0.5", MQTT_PORT, &None);
        assert_eq!(opts.broker_address(), ("10.0.0.5".to_string(), 2883));
        assert_eq!(opts.client_id(), "powerley-energybridge-homecontrol");
        assert_eq!(opts.credentials(), None);

        let opts = build_options(
            "10.0.0.5",
            MQTT_PORT,
            &Some(Credentials {
                username: "admin".to_string(),
                password: "trinity".to_string(),
            }),
        );
        assert_eq!(
            opts.credentials(),
            Some(("admin".to_string(), "trinity".to_string()))
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        // Nothing listens on port 1 of the loopback interface.
        let opts = MqttOptions::new(MQTT_CLIENT_ID, "127.0.0.1", 1);
        let result = connect(opts, Duration::from_secs(5), LogConfig::default()).await;
        assert!(matches!(
            result,
            Err(BridgeError::Connect { .. }) | Err(BridgeError::ConnectTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_times_out_against_silent_broker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept but never answer the CONNECT packet.
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(5)).await;
        });

        let opts = MqttOptions::new(MQTT_CLIENT_ID, "127.0.0.1", port);
        let result = connect(opts, Duration::from_millis(200), LogConfig::default()).await;
        assert!(matches!(result, Err(BridgeError::ConnectTimeout(_))));
    }

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const SUBSCRIBE: u8 = 8;
    const PUBLISH: u8 = 3;
    const DISCONNECT: u8 = 14;

    /// Reads one MQTT control packet as (first header byte, body).
    async fn read_packet(socket: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = socket.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = socket.read_u8().await.ok()?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        socket.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let remaining = 2 + topic.len() + payload.len();
        assert!(remaining < 128);
        let mut packet = vec![0x30, remaining as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Minimal single-session broker. Acknowledges the connection, pushes
    /// `greeting` right after, answers every SUBSCRIBE with `suback_code` and
    /// returns the packet types the client sent.
    async fn fake_broker(
        listener: TcpListener,
        greeting: Option<Vec<u8>>,
        suback_code: u8,
    ) -> Vec<u8> {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        while let Some((header, body)) = read_packet(&mut socket).await {
            let kind = header >> 4;
            seen.push(kind);
            match kind {
                1 => {
                    socket.write_all(&CONNACK).await.unwrap();
                    if let Some(packet) = &greeting {
                        socket.write_all(packet).await.unwrap();
                    }
                }
                SUBSCRIBE => {
                    let suback = [0x90, 0x03, body[0], body[1], suback_code];
                    socket.write_all(&suback).await.unwrap();
                }
                DISCONNECT => break,
                _ => {}
            }
        }
        seen
    }

    async fn fake_broker_options(
        greeting: Option<Vec<u8>>,
        suback_code: u8,
    ) -> (MqttOptions, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(fake_broker(listener, greeting, suback_code));
        (build_options("127.0.0.1", port, &None), broker)
    }

    #[tokio::test]
    async fn test_run_fans_out_published_demand_and_disconnects() {
        let greeting = publish_packet("event/metering/instantaneous_demand", br#"{"demand": 842}"#);
        let (opts, broker) = fake_broker_options(Some(greeting), 0x00).await;
        let (_client, source) = connect(opts, Duration::from_secs(2), LogConfig::default())
            .await
            .unwrap();

        let (accessory, gauge, fan_out) = sinks();
        let cancel = CancellationToken::new();
        let grace = Duration::from_millis(250);
        let handle = tokio::spawn(source.run(Arc::new(fan_out), cancel.clone(), grace));

        timeout(Duration::from_secs(2), async {
            while accessory.consumption() != 842 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("demand should reach the accessory");
        assert_eq!(gauge.value(), 842.0);

        let started = std::time::Instant::now();
        cancel.cancel();
        timeout(grace * 2, handle)
            .await
            .expect("source should stop within the disconnect grace")
            .unwrap();
        assert!(started.elapsed() < grace * 2);

        let seen = timeout(Duration::from_secs(1), broker).await.unwrap().unwrap();
        assert_eq!(seen.last(), Some(&DISCONNECT));
    }

    #[tokio::test]
    async fn test_renewal_completes_on_broker_acknowledgement() {
        let (opts, broker) = fake_broker_options(None, 0x00).await;
        let (client, source) = connect(opts, Duration::from_secs(2), LogConfig::default())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(
            Arc::new(FanOut::default()),
            cancel.clone(),
            Duration::from_millis(250),
        ));

        let mut scheduler = RenewalScheduler::new(
            client,
            Duration::from_secs(180),
            Duration::from_secs(300),
            LogConfig::default(),
        )
        .unwrap()
        .with_operation_timeout(Duration::from_secs(2));
        scheduler.renew().await.unwrap();
        assert_eq!(scheduler.state(), RenewalState::Subscribed);

        cancel.cancel();
        handle.await.unwrap();
        let seen = broker.await.unwrap();
        assert_eq!(seen, vec![1, SUBSCRIBE, PUBLISH, PUBLISH, DISCONNECT]);
    }

    #[tokio::test]
    async fn test_renewal_fails_on_rejected_subscription() {
        let (opts, _broker) = fake_broker_options(None, 0x80).await;
        let (client, source) = connect(opts, Duration::from_secs(2), LogConfig::default())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(
            Arc::new(FanOut::default()),
            cancel.clone(),
            Duration::from_millis(250),
        ));

        let mut scheduler = RenewalScheduler::new(
            client,
            Duration::from_secs(180),
            Duration::from_secs(300),
            LogConfig::default(),
        )
        .unwrap()
        .with_operation_timeout(Duration::from_secs(2));
        let err = scheduler.renew().await.unwrap_err();
        assert!(matches!(err, BridgeError::SubscriptionRejected { .. }));
        assert_eq!(scheduler.state(), RenewalState::Idle);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_requests_resubscribe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _broker = tokio::spawn(async move {
            // First session is dropped right after the CONNACK.
            for _ in 0..2 {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_packet(&mut socket).await.unwrap();
                socket.write_all(&CONNACK).await.unwrap();
                drop(socket);
            }
            std::future::pending::<()>().await;
        });

        let opts = build_options("127.0.0.1", port, &None);
        let (_client, source) = connect(opts, Duration::from_secs(2), LogConfig::default())
            .await
            .unwrap();
        let signal = source.resubscribe_signal();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(
            Arc::new(FanOut::default()),
            cancel.clone(),
            Duration::from_millis(250),
        ));

        timeout(RECONNECT_DELAY + Duration::from_secs(3), signal.notified())
            .await
            .expect("reconnect should request a fresh subscription");

        cancel.cancel();
        handle.await.unwrap();
    }
}
