use crate::chunk::{chunk_count, ChunkPlan};
use crate::config::DownloadConfig;
use crate::download::blob::BlobStore;
use crate::download::error::DownloadResult;
use crate::download::in_flight::InFlight;
use crate::download::rate_limiter::RequestRateLimiter;
use crate::integrity::{IntegrityVerifier, StreamingHasher};
use crate::release::{
    Asset, AssetKey, DownloadStatus, ExtractionStatus, ReleaseCatalog, ReleaseHost, RetryState,
};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

/// What one `step` did to an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do right now (not pending, waiting for a retry, or already in flight)
    Idle,
    /// Local bytes could not be trusted; the download starts over
    Restarted,
    Chunk { completed: u64, total: u64 },
    Retrying { attempts: u32 },
    Completed { size: u64 },
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// The request or the local write failed; the chunk is fetched again
    Transport,
    /// All bytes arrived but the digest did not match; the asset starts over
    Verification,
}

struct CachedHasher {
    generation: u64,
    hasher: StreamingHasher,
}

/// Fetches asset bytes one range request per step and verifies them on the last chunk.
pub struct AssetDownloader {
    catalog: Arc<ReleaseCatalog>,
    host: Arc<dyn ReleaseHost>,
    blobs: BlobStore,
    config: DownloadConfig,
    limiter: RequestRateLimiter,
    hashers: DashMap<AssetKey, CachedHasher>,
    in_flight: InFlight<AssetKey>,
}

impl AssetDownloader {
    pub fn new(
        catalog: Arc<ReleaseCatalog>,
        host: Arc<dyn ReleaseHost>,
        blobs: BlobStore,
        config: DownloadConfig,
    ) -> Self {
        Self {
            limiter: RequestRateLimiter::new(config.chunks_per_second),
            catalog,
            host,
            blobs,
            config,
            hashers: DashMap::new(),
            in_flight: InFlight::new(),
        }
    }

    /// Advance every pending asset by at most one chunk.
    pub async fn tick(&self) -> usize {
        let queue = self.catalog.download_queue();
        let results =
            futures::future::join_all(queue.iter().map(|(key, _)| self.step(key))).await;

        let mut advanced = 0;
        for ((key, _), result) in queue.iter().zip(results) {
            match result {
                Ok(StepOutcome::Idle) => {}
                Ok(_) => advanced += 1,
                Err(e) => tracing::warn!("Download step for {} failed: {}", key, e),
            }
        }
        advanced
    }

    fn take_hasher(&self, key: &AssetKey, generation: u64, offset: u64) -> Option<StreamingHasher> {
        let (_, cached) = self.hashers.remove(key)?;
        (cached.generation == generation && cached.hasher.bytes_hashed() == offset)
            .then_some(cached.hasher)
    }

    /// Fetch the next chunk of one asset.
    pub async fn step(&self, key: &AssetKey) -> DownloadResult<StepOutcome> {
        let Some(_guard) = self.in_flight.try_claim(key) else {
            return Ok(StepOutcome::Idle);
        };
        let Some(asset) = self.catalog.asset(key) else {
            return Ok(StepOutcome::Idle);
        };

        let chunk_size = self.config.chunk_size;
        let total = chunk_count(asset.size, chunk_size);
        let (completed, errors) = match asset.download_status {
            DownloadStatus::NotStarted => (0, 0),
            // A changed chunk size makes the recorded counters meaningless
            DownloadStatus::Downloading {
                chunks_completed,
                chunks_error,
                chunks_total,
            } if chunks_total == total => (chunks_completed, chunks_error),
            DownloadStatus::Downloading { chunks_error, .. } => (0, chunks_error),
            _ => return Ok(StepOutcome::Idle),
        };
        if let Some(at) = asset.retry.next_attempt_at {
            if at > Utc::now() {
                return Ok(StepOutcome::Idle);
            }
        }

        let plan = ChunkPlan::for_len(asset.size, chunk_size);
        let Some(range) = plan.get(completed).and_then(|c| c.range()) else {
            return self.finish(key, &asset, StreamingHasher::new(), errors, total).await;
        };

        let offset = range.start;
        let mut hasher = match self.take_hasher(key, asset.generation, offset) {
            Some(hasher) => hasher,
            None if offset == 0 => StreamingHasher::new(),
            None => match IntegrityVerifier::hash_file_prefix(&self.blobs.path(key), offset).await {
                Ok(hasher) => hasher,
                Err(e) => {
                    tracing::warn!("Cannot rebuild hash for {} from disk, restarting: {}", key, e);
                    self.catalog
                        .update_asset(key, asset.generation, |a| {
                            a.download_status = DownloadStatus::Downloading {
                                chunks_completed: 0,
                                chunks_error: errors,
                                chunks_total: total,
                            };
                        })
                        .await?;
                    return Ok(StepOutcome::Restarted);
                }
            },
        };

        self.limiter.wait_for_request().await;
        let bytes = match self.host.fetch_range(&asset.download_url, range).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.hashers.insert(
                    key.clone(),
                    CachedHasher {
                        generation: asset.generation,
                        hasher,
                    },
                );
                let reason = e.to_string();
                return self
                    .record_failure(
                        key,
                        &asset,
                        completed,
                        errors,
                        total,
                        reason,
                        Failure::Transport,
                    )
                    .await;
            }
        };

        if let Err(e) = self.blobs.write_at(key, offset, &bytes, offset == 0).await {
            let reason = e.to_string();
            return self
                .record_failure(key, &asset, completed, errors, total, reason, Failure::Transport)
                .await;
        }
        hasher.update(&bytes);
        crate::metrics::record_chunk_downloaded(bytes.len() as u64);

        let completed = completed + 1;
        if completed == total {
            return self.finish(key, &asset, hasher, errors, total).await;
        }

        let applied = self
            .catalog
            .update_asset(key, asset.generation, |a| {
                a.download_status = DownloadStatus::Downloading {
                    chunks_completed: completed,
                    chunks_error: errors,
                    chunks_total: total,
                };
                a.retry = RetryState {
                    verification_failures: a.retry.verification_failures,
                    ..RetryState::default()
                };
            })
            .await?;
        if !applied {
            return Ok(StepOutcome::Idle);
        }

        self.hashers.insert(
            key.clone(),
            CachedHasher {
                generation: asset.generation,
                hasher,
            },
        );
        tracing::debug!("{}: chunk {}/{}", key, completed, total);
        Ok(StepOutcome::Chunk { completed, total })
    }

    async fn finish(
        &self,
        key: &AssetKey,
        asset: &Asset,
        hasher: StreamingHasher,
        errors: u64,
        total: u64,
    ) -> DownloadResult<StepOutcome> {
        let actual = hasher.finalize();
        if let Some(expected) = &asset.sha256 {
            if let Err(e) = IntegrityVerifier::verify(expected, &actual) {
                tracing::warn!("{}: {}", key, e);
                let reason = e.to_string();
                return self
                    .record_failure(key, asset, 0, errors, total, reason, Failure::Verification)
                    .await;
            }
        }

        self.blobs.set_len(key, asset.size).await?;

        let size = asset.size;
        let archive = asset.is_archive();
        let applied = self
            .catalog
            .update_asset(key, asset.generation, |a| {
                a.download_status = DownloadStatus::Completed { size };
                a.sha256.get_or_insert(actual);
                a.retry = RetryState::default();
                if archive {
                    a.extraction_status = Some(ExtractionStatus::Idle);
                    a.extraction_cursor = None;
                }
            })
            .await?;
        if !applied {
            return Ok(StepOutcome::Idle);
        }

        crate::metrics::record_asset_verified();
        tracing::info!("Downloaded {} ({} bytes, {})", key, size, actual.to_digest());
        Ok(StepOutcome::Completed { size })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_failure(
        &self,
        key: &AssetKey,
        asset: &Asset,
        completed: u64,
        errors: u64,
        total: u64,
        message: String,
        failure: Failure,
    ) -> DownloadResult<StepOutcome> {
        let policy = &self.config.retry;
        let mut retry = asset.retry.clone();
        let attempts = match failure {
            Failure::Transport => {
                retry.attempts += 1;
                retry.attempts
            }
            Failure::Verification => {
                retry.verification_failures += 1;
                retry.attempts = 0;
                retry.verification_failures
            }
        };
        let errors = errors + 1;
        crate::metrics::record_chunk_failed();

        if policy.is_exhausted(attempts) {
            let message = format!("{} (gave up after {} attempts)", message, attempts);
            tracing::error!("Download of {} failed: {}", key, message);
            self.hashers.remove(key);
            let final_message = message.clone();
            self.catalog
                .update_asset(key, asset.generation, |a| {
                    a.download_status = DownloadStatus::Error {
                        message: final_message,
                    };
                    a.retry = RetryState::default();
                })
                .await?;
            return Ok(StepOutcome::Failed { message });
        }

        let delay = policy.delay_for_attempt(attempts);
        let wait = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let next_attempt_at = Utc::now() + wait;
        tracing::warn!(
            "{}: chunk failed (attempt {}), retrying in {:?}: {}",
            key,
            attempts,
            delay,
            message
        );

        let completed = match failure {
            Failure::Transport => completed,
            Failure::Verification => 0,
        };
        retry.next_attempt_at = Some(next_attempt_at);
        retry.last_error = Some(message);
        self.catalog
            .update_asset(key, asset.generation, |a| {
                a.download_status = DownloadStatus::Downloading {
                    chunks_completed: completed,
                    chunks_error: errors,
                    chunks_total: total,
                };
                a.retry = retry;
            })
            .await?;
        Ok(StepOutcome::Retrying { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::db;
    use crate::integrity::ContentHash;
    use crate::sim::SimulatedReleaseHost;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        host: Arc<SimulatedReleaseHost>,
        catalog: Arc<ReleaseCatalog>,
        downloader: AssetDownloader,
        blobs: BlobStore,
    }

    async fn fixture(data: Bytes, retry: RetryPolicy) -> Fixture {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(SimulatedReleaseHost::new());
        host.add_release("v1", false, false, vec![("vault.wasm", data)]);

        let blobs = BlobStore::new(dir.path());
        let pool = db::connect("sqlite::memory:").await.unwrap();
        let catalog = Arc::new(
            ReleaseCatalog::new(pool, host.clone(), blobs.clone())
                .await
                .unwrap(),
        );
        catalog.refresh().await.unwrap();

        let config = DownloadConfig {
            chunk_size: 100,
            chunks_per_second: 0,
            retry,
        };
        let downloader = AssetDownloader::new(catalog.clone(), host.clone(), blobs.clone(), config);
        Fixture {
            _dir: dir,
            host,
            catalog,
            downloader,
            blobs,
        }
    }

    fn no_delay(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn test_download_in_chunks() {
        let data = payload(250);
        let f = fixture(data.clone(), no_delay(3)).await;
        let key = AssetKey::new("v1", "vault.wasm");

        assert_eq!(
            f.downloader.step(&key).await.unwrap(),
            StepOutcome::Chunk { completed: 1, total: 3 }
        );
        let asset = f.catalog.asset(&key).unwrap();
        assert_eq!(
            asset.download_status,
            DownloadStatus::Downloading {
                chunks_completed: 1,
                chunks_error: 0,
                chunks_total: 3
            }
        );

        f.downloader.step(&key).await.unwrap();
        assert_eq!(
            f.downloader.step(&key).await.unwrap(),
            StepOutcome::Completed { size: 250 }
        );

        let on_disk = tokio::fs::read(f.blobs.path(&key)).await.unwrap();
        assert_eq!(on_disk, data.to_vec());
        assert_eq!(f.host.fetch_count(), 3);

        // Completed assets are left alone
        assert_eq!(f.downloader.step(&key).await.unwrap(), StepOutcome::Idle);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(payload(150), no_delay(3)).await;
        let key = AssetKey::new("v1", "vault.wasm");

        f.host.fail_next_fetches(2);
        assert_eq!(
            f.downloader.step(&key).await.unwrap(),
            StepOutcome::Retrying { attempts: 1 }
        );
        assert_eq!(
            f.downloader.step(&key).await.unwrap(),
            StepOutcome::Retrying { attempts: 2 }
        );
        assert!(matches!(
            f.downloader.step(&key).await.unwrap(),
            StepOutcome::Chunk { completed: 1, total: 2 }
        ));
        assert_eq!(
            f.downloader.step(&key).await.unwrap(),
            StepOutcome::Completed { size: 150 }
        );

        match f.catalog.asset(&key).unwrap().download_status {
            DownloadStatus::Completed { size } => assert_eq!(size, 150),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhausted_budget_marks_error() {
        let f = fixture(payload(50), no_delay(2)).await;
        let key = AssetKey::new("v1", "vault.wasm");

        f.host.fail_next_fetches(5);
        f.downloader.step(&key).await.unwrap();
        assert!(matches!(
            f.downloader.step(&key).await.unwrap(),
            StepOutcome::Failed { .. }
        ));
        assert!(matches!(
            f.catalog.asset(&key).unwrap().download_status,
            DownloadStatus::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_hash_mismatch_never_completes() {
        let f = fixture(payload(120), no_delay(3)).await;
        let key = AssetKey::new("v1", "vault.wasm");
        f.host
            .set_advertised_digest("v1", "vault.wasm", Some(ContentHash([7u8; 32])));
        // Re-read the wrong digest into the catalog
        f.catalog.refresh().await.unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..10 {
            outcomes.push(f.downloader.step(&key).await.unwrap());
        }

        assert!(!outcomes
            .iter()
            .any(|o| matches!(o, StepOutcome::Completed { .. })));
        assert!(matches!(
            f.catalog.asset(&key).unwrap().download_status,
            DownloadStatus::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_resume_rebuilds_hash_from_disk() {
        let data = payload(300);
        let f = fixture(data.clone(), no_delay(3)).await;
        let key = AssetKey::new("v1", "vault.wasm");

        f.downloader.step(&key).await.unwrap();
        f.downloader.step(&key).await.unwrap();

        // A fresh downloader has no in-memory hasher, as after a restart
        let config = DownloadConfig {
            chunk_size: 100,
            chunks_per_second: 0,
            retry: no_delay(3),
        };
        let resumed =
            AssetDownloader::new(f.catalog.clone(), f.host.clone(), f.blobs.clone(), config);
        assert_eq!(
            resumed.step(&key).await.unwrap(),
            StepOutcome::Completed { size: 300 }
        );
        assert_eq!(
            f.catalog.asset(&key).unwrap().sha256,
            Some(IntegrityVerifier::calculate_checksum(&data))
        );
    }

    #[tokio::test]
    async fn test_empty_asset_completes() {
        let f = fixture(Bytes::new(), no_delay(3)).await;
        let key = AssetKey::new("v1", "vault.wasm");

        assert_eq!(
            f.downloader.step(&key).await.unwrap(),
            StepOutcome::Completed { size: 0 }
        );
        assert_eq!(f.host.fetch_count(), 0);
    }
}
