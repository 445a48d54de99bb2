use clap::Parser;
use energybridge_homecontrol::{
    lifecycle::{self, Controller},
    logging::{self, LogConfig},
    Args, Config,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log = LogConfig::from_env();
    logging::init(log);

    let config = Config::from_args(Args::parse(), log)?;
    info!(
        host = %config.host,
        source = ?config.source,
        "Starting energy bridge home control"
    );

    // Startup failures (bad config, unreachable broker, busy port) end the
    // process here rather than running a partial pipeline.
    let running = Controller::new(config).start().await?;
    info!(addr = %running.metrics_addr(), "pipeline running");

    running.run_until(lifecycle::termination_signal()).await;
    info!("shutdown complete");
    Ok(())
}
