//! Prometheus metrics exporter

use crate::metrics::recorder::init_metrics;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to setup metrics: {0}")]
    SetupFailed(String),
}

/// Install the Prometheus recorder and spawn its scrape listener on `listen_addr`.
///
/// Must run inside a tokio runtime. Only the first call installs anything; later calls
/// return the existing handle.
pub fn start_metrics_server(
    listen_addr: SocketAddr,
) -> Result<&'static PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }

    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .build()
        .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).map_err(|e| MetricsError::SetupFailed(e.to_string()))?;
    init_metrics();

    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!("Metrics listener stopped: {:?}", e);
        }
    });
    tracing::info!("Prometheus metrics listening on {}", listen_addr);

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// `GET /metrics` on the API router, for deployments that scrape the API port
pub fn metrics_route<S>() -> axum::routing::MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    use axum::response::IntoResponse;

    axum::routing::get(|| async {
        match render_metrics() {
            Some(metrics) => (
                [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                metrics,
            )
                .into_response(),
            None => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                "Metrics not initialized",
            )
                .into_response(),
        }
    })
}
