//! Prometheus scrape endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::BridgeError;
use crate::sink::PowerGauge;

pub const METRICS_PATH: &str = "/metrics";
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router(gauge: Arc<PowerGauge>) -> Router {
    Router::new()
        .route(METRICS_PATH, get(metrics))
        .fallback(redirect_to_metrics)
        .with_state(gauge)
}

async fn metrics(State(gauge): State<Arc<PowerGauge>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], gauge.render())
}

async fn redirect_to_metrics() -> impl IntoResponse {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, METRICS_PATH)])
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, BridgeError> {
    TcpListener::bind(addr).await.map_err(|source| BridgeError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Serves until `cancel` fires, then finishes in-flight scrapes and returns.
pub async fn serve(
    listener: TcpListener,
    gauge: Arc<PowerGauge>,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Starting Prometheus exporter");
    }
    axum::serve(listener, router(gauge))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
