use crate::download::BlobStore;
use crate::release::error::{ReleaseError, ReleaseResult};
use crate::release::host::{ReleaseHost, RemoteAsset};
use crate::release::selector::ReleaseSelector;
use crate::release::types::{
    Asset, AssetKey, DownloadStatus, ExtractionStatus, RefreshSummary, Release,
    ReleaseFullStatus, ReleasesFullStatus,
};
use parking_lot::RwLock;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;

/// All releases ever discovered, with per-asset ingestion state.
///
/// Reads are served from memory. Every mutation is written through to the
/// `releases` table before the write lock is released, so the table always
/// holds the latest state of each release.
pub struct ReleaseCatalog {
    pool: SqlitePool,
    host: Arc<dyn ReleaseHost>,
    blobs: BlobStore,
    releases: RwLock<Vec<Release>>,
    write_lock: Mutex<()>,
    refresh_lock: Mutex<()>,
}

impl ReleaseCatalog {
    pub async fn new(
        pool: SqlitePool,
        host: Arc<dyn ReleaseHost>,
        blobs: BlobStore,
    ) -> ReleaseResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS releases (
                tag_name TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                release TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows = sqlx::query("SELECT release FROM releases ORDER BY position")
            .fetch_all(&pool)
            .await?;

        let mut releases = Vec::with_capacity(rows.len());
        for row in rows {
            let release: Release = serde_json::from_str(&row.try_get::<String, _>("release")?)?;
            releases.push(release);
        }
        if !releases.is_empty() {
            tracing::info!("Loaded {} releases from catalog", releases.len());
        }

        Ok(Self {
            pool,
            host,
            blobs,
            releases: RwLock::new(releases),
            write_lock: Mutex::new(()),
            refresh_lock: Mutex::new(()),
        })
    }

    async fn persist(&self, position: usize, release: &Release) -> ReleaseResult<()> {
        let json = serde_json::to_string(release)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO releases (tag_name, position, release, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&release.tag_name)
        .bind(position as i64)
        .bind(json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-poll the release host and merge what it advertises.
    ///
    /// Refreshes are serialized. Known releases keep their metadata; an asset whose
    /// advertised digest changed, or that ended in `Error`, is reset so it is fetched again.
    pub async fn refresh(&self) -> ReleaseResult<RefreshSummary> {
        let _refresh = self.refresh_lock.lock().await;
        let remote = self.host.list_releases().await?;

        let _write = self.write_lock.lock().await;
        let mut summary = RefreshSummary::default();
        let mut changed: Vec<(usize, Release)> = Vec::new();
        let mut discarded: Vec<AssetKey> = Vec::new();

        {
            let mut releases = self.releases.write();
            for remote_release in remote {
                let position = releases
                    .iter()
                    .position(|r| r.tag_name == remote_release.tag_name);

                match position {
                    None => {
                        let release = Release {
                            assets: remote_release.assets.into_iter().map(new_asset).collect(),
                            tag_name: remote_release.tag_name,
                            name: remote_release.name,
                            draft: remote_release.draft,
                            prerelease: remote_release.prerelease,
                            created_at: remote_release.created_at,
                            published_at: remote_release.published_at,
                        };
                        tracing::info!(
                            "Discovered release {} with {} assets",
                            release.tag_name,
                            release.assets.len()
                        );
                        summary.added_releases += 1;
                        releases.push(release.clone());
                        changed.push((releases.len() - 1, release));
                    }
                    Some(index) => {
                        let release = &mut releases[index];
                        let tag = release.tag_name.clone();
                        let mut dirty = false;

                        for remote_asset in remote_release.assets {
                            let existing =
                                release.assets.iter_mut().find(|a| a.name == remote_asset.name);
                            match existing {
                                None => {
                                    release.assets.push(new_asset(remote_asset));
                                    summary.added_assets += 1;
                                    dirty = true;
                                }
                                Some(asset) if content_changed(asset, &remote_asset) => {
                                    tracing::info!(
                                        "Asset {}/{} changed upstream, re-downloading",
                                        tag,
                                        asset.name
                                    );
                                    asset.sha256 = remote_asset.sha256;
                                    asset.size = remote_asset.size;
                                    asset.download_url = remote_asset.download_url;
                                    asset.invalidate();
                                    discarded.push(AssetKey::new(&tag, &asset.name));
                                    summary.invalidated_assets += 1;
                                    dirty = true;
                                }
                                Some(asset) if asset.download_status.is_failed() => {
                                    tracing::info!(
                                        "Retrying failed asset {}/{}",
                                        tag,
                                        asset.name
                                    );
                                    asset.invalidate();
                                    discarded.push(AssetKey::new(&tag, &asset.name));
                                    summary.retried_assets += 1;
                                    dirty = true;
                                }
                                Some(_) => {}
                            }
                        }

                        if dirty {
                            changed.push((index, release.clone()));
                        }
                    }
                }
            }
        }

        for key in &discarded {
            if let Err(e) = self.blobs.remove(key).await {
                tracing::warn!("Failed to discard blob for {}: {}", key, e);
            }
        }
        for (position, release) in &changed {
            self.persist(*position, release).await?;
        }

        crate::metrics::record_refresh(&summary);
        Ok(summary)
    }

    /// Apply `update` to an asset if it is still at `generation`.
    ///
    /// Returns `false` when the asset was invalidated since the caller read it.
    pub async fn update_asset<F>(
        &self,
        key: &AssetKey,
        generation: u64,
        update: F,
    ) -> ReleaseResult<bool>
    where
        F: FnOnce(&mut Asset),
    {
        let _write = self.write_lock.lock().await;

        let (position, snapshot) = {
            let mut releases = self.releases.write();
            let position = releases
                .iter()
                .position(|r| r.tag_name == key.tag)
                .ok_or_else(|| ReleaseError::AssetNotFound(key.to_string()))?;
            let asset = releases[position]
                .asset_mut(&key.name)
                .ok_or_else(|| ReleaseError::AssetNotFound(key.to_string()))?;

            if asset.generation != generation {
                return Ok(false);
            }
            update(asset);
            (position, releases[position].clone())
        };

        self.persist(position, &snapshot).await?;
        Ok(true)
    }

    pub fn releases(&self) -> Vec<Release> {
        self.releases.read().clone()
    }

    pub fn get(&self, tag: &str) -> Option<Release> {
        self.releases.read().iter().find(|r| r.tag_name == tag).cloned()
    }

    pub fn asset(&self, key: &AssetKey) -> Option<Asset> {
        self.releases
            .read()
            .iter()
            .find(|r| r.tag_name == key.tag)
            .and_then(|r| r.asset(&key.name))
            .cloned()
    }

    pub fn select(&self, selector: &ReleaseSelector) -> ReleaseResult<Release> {
        let releases = self.releases.read();
        selector.select(releases.iter()).cloned()
    }

    /// Assets the downloader still owes bytes for.
    pub fn download_queue(&self) -> Vec<(AssetKey, Asset)> {
        self.collect_assets(|a| a.download_status.is_pending())
    }

    /// Downloaded archives whose manifest is not complete yet.
    pub fn extraction_queue(&self) -> Vec<(AssetKey, Asset)> {
        self.collect_assets(|a| {
            a.download_status.is_completed()
                && matches!(
                    a.extraction_status,
                    Some(ExtractionStatus::Idle) | Some(ExtractionStatus::Decoding { .. })
                )
        })
    }

    fn collect_assets(&self, filter: impl Fn(&Asset) -> bool) -> Vec<(AssetKey, Asset)> {
        self.releases
            .read()
            .iter()
            .flat_map(|r| {
                r.assets
                    .iter()
                    .filter(|a| filter(a))
                    .map(|a| (AssetKey::new(&r.tag_name, &a.name), a.clone()))
            })
            .collect()
    }

    pub fn status(&self, default_selector: &ReleaseSelector) -> ReleasesFullStatus {
        let releases = self.releases.read();

        let count = |f: fn(&DownloadStatus) -> bool| -> u64 {
            releases
                .iter()
                .flat_map(|r| r.assets.iter())
                .filter(|a| f(&a.download_status))
                .count() as u64
        };

        ReleasesFullStatus {
            releases_count: releases.len() as u64,
            pending_downloads: count(DownloadStatus::is_pending),
            completed_downloads: count(DownloadStatus::is_completed),
            failed_downloads: count(DownloadStatus::is_failed),
            has_downloaded_release: releases.iter().any(Release::is_downloaded),
            has_deployment_ready_release: releases.iter().any(Release::is_deployment_ready),
            default_version_key: default_selector
                .select(releases.iter())
                .ok()
                .map(|r| r.tag_name.clone()),
            releases: releases.iter().map(ReleaseFullStatus::from).collect(),
        }
    }
}

fn new_asset(remote: RemoteAsset) -> Asset {
    Asset::new(
        remote.name,
        remote.content_type,
        remote.size,
        remote.sha256,
        remote.download_url,
    )
}

fn content_changed(local: &Asset, remote: &RemoteAsset) -> bool {
    match (&local.sha256, &remote.sha256) {
        (_, Some(remote_hash)) => local.sha256.as_ref() != Some(remote_hash),
        // Without a digest the size is the only signal
        (_, None) => local.size != remote.size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::sim::SimulatedReleaseHost;
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn catalog(host: Arc<SimulatedReleaseHost>, dir: &TempDir) -> ReleaseCatalog {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        ReleaseCatalog::new(pool, host, BlobStore::new(dir.path()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_discovers_releases() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(SimulatedReleaseHost::new());
        host.add_release("v1", false, false, vec![("vault.wasm", Bytes::from_static(b"module"))]);
        let catalog = catalog(host.clone(), &dir).await;

        let summary = catalog.refresh().await.unwrap();
        assert_eq!(summary.added_releases, 1);

        let status = catalog.status(&ReleaseSelector::Latest);
        assert_eq!(status.releases_count, 1);
        assert_eq!(status.pending_downloads, 1);
        assert!(!status.has_downloaded_release);
        assert_eq!(status.default_version_key, None);

        // A second refresh with nothing new changes nothing
        let again = catalog.refresh().await.unwrap();
        assert_eq!(again, RefreshSummary::default());
    }

    #[tokio::test]
    async fn test_changed_digest_invalidates_asset() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(SimulatedReleaseHost::new());
        host.add_release("v1", false, false, vec![("vault.wasm", Bytes::from_static(b"one"))]);
        let catalog = catalog(host.clone(), &dir).await;
        catalog.refresh().await.unwrap();

        let key = AssetKey::new("v1", "vault.wasm");
        catalog
            .update_asset(&key, 0, |a| a.download_status = DownloadStatus::Completed { size: 3 })
            .await
            .unwrap();

        host.replace_asset("v1", "vault.wasm", Bytes::from_static(b"two!"));
        let summary = catalog.refresh().await.unwrap();
        assert_eq!(summary.invalidated_assets, 1);

        let asset = catalog.asset(&key).unwrap();
        assert_eq!(asset.download_status, DownloadStatus::NotStarted);
        assert_eq!(asset.size, 4);
        assert_eq!(asset.generation, 1);

        // Writes against the stale generation are dropped
        let applied = catalog
            .update_asset(&key, 0, |a| a.download_status = DownloadStatus::Completed { size: 3 })
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_error_assets_are_retried_on_refresh() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(SimulatedReleaseHost::new());
        host.add_release("v1", false, false, vec![("vault.wasm", Bytes::from_static(b"one"))]);
        let catalog = catalog(host.clone(), &dir).await;
        catalog.refresh().await.unwrap();

        let key = AssetKey::new("v1", "vault.wasm");
        catalog
            .update_asset(&key, 0, |a| {
                a.download_status = DownloadStatus::Error {
                    message: "boom".into(),
                }
            })
            .await
            .unwrap();

        let summary = catalog.refresh().await.unwrap();
        assert_eq!(summary.retried_assets, 1);
        assert_eq!(catalog.download_queue().len(), 1);
    }

    #[tokio::test]
    async fn test_catalog_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let host = Arc::new(SimulatedReleaseHost::new());
        host.add_release("v1", false, false, vec![("vault.wasm", Bytes::from_static(b"one"))]);
        host.add_release("v2", false, false, vec![("vault.wasm", Bytes::from_static(b"two"))]);

        {
            let pool = db::connect(&url).await.unwrap();
            let catalog = ReleaseCatalog::new(pool, host.clone(), BlobStore::new(dir.path()))
                .await
                .unwrap();
            catalog.refresh().await.unwrap();
        }

        let pool = db::connect(&url).await.unwrap();
        let reloaded = ReleaseCatalog::new(pool, host, BlobStore::new(dir.path()))
            .await
            .unwrap();
        let tags: Vec<String> = reloaded.releases().into_iter().map(|r| r.tag_name).collect();
        assert_eq!(tags, vec!["v1", "v2"]);
    }
}
