//! Metrics and observability
//!
//! Prometheus-compatible counters for release ingestion (chunks downloaded, assets
//! verified, archives extracted) and storage deployment (records started, completed,
//! failed, upgraded).

pub mod exporter;
pub mod recorder;

pub use exporter::{metrics_route, render_metrics, start_metrics_server, MetricsError};
pub use recorder::{
    init_metrics, record_archive_extracted, record_asset_verified, record_chunk_downloaded,
    record_chunk_failed, record_chunks_pushed, record_deployment_completed,
    record_deployment_failed, record_deployment_started, record_refresh, record_upgrade_finished,
    record_upgrade_started, set_active_storages, TickTimer,
};
