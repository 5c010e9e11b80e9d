//! Metrics recorder for release ingestion and storage deployment
//!
//! Without an installed recorder every call here is a no-op.

use crate::release::RefreshSummary;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    // Ingestion
    describe_counter!("vault_releases_discovered_total", "Releases added to the catalog");
    describe_counter!(
        "vault_assets_invalidated_total",
        "Assets reset because their content changed or they had failed"
    );
    describe_counter!("vault_chunks_downloaded_total", "Ranged reads that succeeded");
    describe_counter!("vault_bytes_downloaded_total", "Asset bytes downloaded");
    describe_counter!("vault_chunks_failed_total", "Ranged reads that failed");
    describe_counter!("vault_assets_verified_total", "Assets whose SHA-256 matched");
    describe_counter!("vault_archives_extracted_total", "Frontend archives fully indexed");
    describe_counter!("vault_archive_files_total", "Files found in extracted archives");

    // Deployment
    describe_counter!("vault_deployments_started_total", "Storage records created");
    describe_counter!("vault_deployments_completed_total", "Storages that reached Completed");
    describe_counter!("vault_deployments_failed_total", "Storages that ended in Failed");
    describe_counter!("vault_upgrades_started_total", "Upgrades accepted");
    describe_counter!("vault_upgrades_finished_total", "Upgrades finished, by outcome");
    describe_counter!("vault_chunks_pushed_total", "Chunks accepted by a storage instance");

    describe_gauge!("vault_active_storages", "Records the scheduler still owes work");
    describe_histogram!("vault_tick_duration_seconds", "Time spent in one scheduler tick");
}

// ============== Ingestion ==============

pub fn record_refresh(summary: &RefreshSummary) {
    counter!("vault_releases_discovered_total").increment(summary.added_releases as u64);
    counter!("vault_assets_invalidated_total", "reason" => "changed")
        .increment(summary.invalidated_assets as u64);
    counter!("vault_assets_invalidated_total", "reason" => "retry")
        .increment(summary.retried_assets as u64);
}

pub fn record_chunk_downloaded(bytes: u64) {
    counter!("vault_chunks_downloaded_total").increment(1);
    counter!("vault_bytes_downloaded_total").increment(bytes);
}

pub fn record_chunk_failed() {
    counter!("vault_chunks_failed_total").increment(1);
}

pub fn record_asset_verified() {
    counter!("vault_assets_verified_total").increment(1);
}

pub fn record_archive_extracted(files: u64) {
    counter!("vault_archives_extracted_total").increment(1);
    counter!("vault_archive_files_total").increment(files);
}

// ============== Deployment ==============

pub fn record_deployment_started() {
    counter!("vault_deployments_started_total").increment(1);
}

pub fn record_deployment_completed() {
    counter!("vault_deployments_completed_total").increment(1);
}

pub fn record_deployment_failed() {
    counter!("vault_deployments_failed_total").increment(1);
}

pub fn record_upgrade_started() {
    counter!("vault_upgrades_started_total").increment(1);
}

pub fn record_upgrade_finished(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("vault_upgrades_finished_total", "outcome" => outcome).increment(1);
}

pub fn record_chunks_pushed(count: u64) {
    counter!("vault_chunks_pushed_total").increment(count);
}

pub fn set_active_storages(count: usize) {
    gauge!("vault_active_storages").set(count as f64);
}

/// Times one scheduler tick and records it on [`stop`](Self::stop).
pub struct TickTimer {
    start_time: Instant,
}

impl TickTimer {
    pub fn start() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn stop(self) -> Duration {
        let elapsed = self.elapsed();
        histogram!("vault_tick_duration_seconds").record(elapsed.as_secs_f64());
        elapsed
    }
}
