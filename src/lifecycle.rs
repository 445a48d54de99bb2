use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, SourceKind, TASK_STOP_GRACE};
use crate::error::BridgeError;
use crate::exporter;
use crate::renewal::{RenewalScheduler, SubscriptionClient};
use crate::sink::{FanOut, PowerAccessory, PowerGauge, Sink};
use crate::source::{mqtt, HttpSource, PollTarget, Source};

/// Owns the process-wide cancellation signal and every pipeline task.
pub struct Controller {
    config: Config,
    cancel: CancellationToken,
    accessory: Arc<PowerAccessory>,
    gauge: Arc<PowerGauge>,
}

impl Controller {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            accessory: Arc::new(PowerAccessory::new()),
            gauge: Arc::new(PowerGauge::new()),
        }
    }

    /// Handle for external termination hooks, such as the accessory stack's.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn accessory(&self) -> Arc<PowerAccessory> {
        self.accessory.clone()
    }

    pub fn gauge(&self) -> Arc<PowerGauge> {
        self.gauge.clone()
    }

    /// Builds the configured source and starts every task. Any error here
    /// means the pipeline cannot run at all.
    pub async fn start(self) -> Result<Running, BridgeError> {
        match self.config.source {
            SourceKind::Mqtt => {
                let options = mqtt::build_options(
                    &self.config.host,
                    self.config.broker_port,
                    &self.config.credentials,
                );
                let (client, source) =
                    mqtt::connect(options, self.config.connect_timeout, self.config.log).await?;
                let scheduler = RenewalScheduler::new(
                    client,
                    self.config.renew_interval,
                    self.config.subscription_ttl,
                    self.config.log,
                )?
                .with_resubscribe_signal(source.resubscribe_signal());
                self.launch_with_renewal(Source::Push(source), scheduler)
                    .await
            }
            SourceKind::Http => {
                let source = HttpSource::new(
                    PollTarget {
                        endpoint_url: self.config.poll_url(),
                        poll_interval: self.config.poll_interval,
                    },
                    self.config.log,
                );
                self.launch(Source::Pull(source)).await
            }
        }
    }

    /// Starts the exporter and the source as independent tasks.
    pub async fn launch(self, source: Source) -> Result<Running, BridgeError> {
        let listener = exporter::bind(self.config.metrics_addr).await?;
        let metrics_addr = listener.local_addr()?;

        let sinks: Vec<Arc<dyn Sink>> = vec![self.accessory.clone(), self.gauge.clone()];
        let fan_out = Arc::new(FanOut::new(sinks));
        let mut tasks = Vec::new();

        let cancel = self.cancel.clone();
        let gauge = self.gauge.clone();
        tasks.push((
            "exporter",
            tokio::spawn(async move {
                if let Err(e) = exporter::serve(listener, gauge, cancel.clone()).await {
                    error!(error = %e, "Prometheus exporter failed, shutting down");
                    cancel.cancel();
                }
            }),
        ));

        info!(source = source.kind(), "Starting energy bridge source");
        tasks.push(("source", tokio::spawn(source.run(fan_out, self.cancel.clone()))));

        Ok(Running {
            cancel: self.cancel,
            tasks,
            metrics_addr,
            accessory: self.accessory,
            gauge: self.gauge,
        })
    }

    /// Like [`Controller::launch`], plus the subscription renewal task a push
    /// source needs.
    pub async fn launch_with_renewal<C>(
        self,
        source: Source,
        scheduler: RenewalScheduler<C>,
    ) -> Result<Running, BridgeError>
    where
        C: SubscriptionClient + 'static,
    {
        let mut running = self.launch(source).await?;
        let renewal = tokio::spawn(scheduler.run(running.cancel.clone()));
        running.tasks.push(("renewal", renewal));
        Ok(running)
    }
}

/// A started pipeline.
pub struct Running {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    metrics_addr: SocketAddr,
    accessory: Arc<PowerAccessory>,
    gauge: Arc<PowerGauge>,
}

impl Running {
    pub fn metrics_addr(&self) -> SocketAddr {
        self.metrics_addr
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn accessory(&self) -> Arc<PowerAccessory> {
        self.accessory.clone()
    }

    pub fn gauge(&self) -> Arc<PowerGauge> {
        self.gauge.clone()
    }

    /// Runs until `trigger` resolves or something cancels the pipeline, then
    /// shuts down.
    pub async fn run_until<F>(self, trigger: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = trigger => info!("termination requested"),
            _ = self.cancel.cancelled() => info!("pipeline cancelled"),
        }
        self.shutdown(TASK_STOP_GRACE).await;
    }

    /// Cancels every task and waits for each to stop. Tasks still running
    /// after `grace` are aborted.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => info!(task = name, "task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
                Err(_) => {
                    warn!(task = name, ?grace, "task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
