//! The deployer facade
//!
//! [`Deployer`] wires the catalog, the ingestion workers and the orchestrator together
//! and exposes the operations callers use. HTTP handlers and the scheduler only ever
//! talk to this type.

use crate::config::{ConfigError, DeployerConfig};
use crate::db;
use crate::deploy::{
    Collaborators, CreateStorageError, CreateStorageOptions, DeleteStorageError, DeployResult,
    DeploymentOrchestrator, UpdateChecker, UpgradeError,
};
use crate::download::{AssetDownloader, BlobStore};
use crate::extract::ArchiveExtractor;
use crate::registry::{
    CanisterId, CreationStatus, Principal, RegistryError, StorageRecord, StorageRegistry,
    UpdateInfo, UpgradeScope,
};
use crate::release::{
    RefreshSummary, ReleaseCatalog, ReleaseError, ReleaseHost, ReleaseResult, ReleasesFullStatus,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Catalog error: {0}")]
    Release(#[from] ReleaseError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Work done by one [`Deployer::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub downloads: usize,
    pub extractions: usize,
    pub storages: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.downloads == 0 && self.extractions == 0 && self.storages == 0
    }
}

pub struct Deployer {
    config: DeployerConfig,
    catalog: Arc<ReleaseCatalog>,
    registry: Arc<StorageRegistry>,
    downloader: AssetDownloader,
    extractor: ArchiveExtractor,
    orchestrator: DeploymentOrchestrator,
    checker: Arc<UpdateChecker>,
    storage_deployer_running: AtomicBool,
    start_time: Instant,
}

impl Deployer {
    pub async fn new(
        config: DeployerConfig,
        host: Arc<dyn ReleaseHost>,
        collaborators: Collaborators,
    ) -> ServiceResult<Self> {
        config.validate()?;
        let pool = db::connect(&config.database_url).await?;
        let blobs = BlobStore::new(&config.data_dir);

        let catalog =
            Arc::new(ReleaseCatalog::new(pool.clone(), host.clone(), blobs.clone()).await?);
        let registry = Arc::new(StorageRegistry::new(pool).await?);

        let checker = Arc::new(UpdateChecker::new(
            registry.clone(),
            catalog.clone(),
            collaborators.platform.clone(),
            collaborators.storage.clone(),
            Principal::new(config.deploy.installer.clone()),
        ));
        let downloader =
            AssetDownloader::new(catalog.clone(), host, blobs.clone(), config.download.clone());
        let extractor =
            ArchiveExtractor::new(catalog.clone(), blobs.clone(), config.extract.clone());
        let orchestrator = DeploymentOrchestrator::new(
            registry.clone(),
            catalog.clone(),
            blobs,
            collaborators,
            checker.clone(),
            config.deploy.clone(),
        );

        // Records left mid-flight by a previous run resume on the first tick.
        let pending = registry.list_active().await?.len();
        if pending > 0 {
            tracing::info!("Resuming {} in-flight storage deployments", pending);
        }

        Ok(Self {
            config,
            catalog,
            registry,
            downloader,
            extractor,
            orchestrator,
            checker,
            storage_deployer_running: AtomicBool::new(pending > 0),
            start_time: Instant::now(),
        })
    }

    pub fn config(&self) -> &DeployerConfig {
        &self.config
    }

    pub fn installer(&self) -> &Principal {
        self.orchestrator.installer()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub async fn refresh_releases(&self) -> ReleaseResult<RefreshSummary> {
        self.catalog.refresh().await
    }

    pub fn get_releases_full_status(&self) -> ReleasesFullStatus {
        self.catalog.status(&self.config.deploy.default_selector)
    }

    pub async fn create_storage(
        &self,
        caller: &Principal,
        options: CreateStorageOptions,
    ) -> Result<StorageRecord, CreateStorageError> {
        let record = self.orchestrator.create_storage(caller, options).await?;
        self.storage_deployer_running.store(true, Ordering::SeqCst);
        Ok(record)
    }

    /// The caller's records, each with its update projection filled in.
    pub async fn list_storages(&self, caller: &Principal) -> DeployResult<Vec<StorageRecord>> {
        let mut records = self.registry.list_by_owner(caller).await?;
        for record in records.iter_mut() {
            record.update_available = self.project_update(record).await;
        }
        Ok(records)
    }

    pub async fn get_storage(&self, id: u64) -> DeployResult<Option<StorageRecord>> {
        let Some(mut record) = self.registry.get(id).await? else {
            return Ok(None);
        };
        record.update_available = self.project_update(&record).await;
        Ok(Some(record))
    }

    /// Every record, unprojected. Used by the progress stream.
    pub async fn all_storages(&self) -> DeployResult<Vec<StorageRecord>> {
        Ok(self.registry.list_all().await?)
    }

    async fn project_update(&self, record: &StorageRecord) -> Option<UpdateInfo> {
        if !matches!(record.status, CreationStatus::Completed { .. }) {
            return None;
        }
        match self.checker.check_record(record).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Update check for storage {} failed: {}", record.id, e);
                None
            }
        }
    }

    pub async fn check_storage_update(
        &self,
        canister_id: &CanisterId,
    ) -> DeployResult<Option<UpdateInfo>> {
        self.checker.check(canister_id).await
    }

    pub async fn upgrade_storage(
        &self,
        caller: &Principal,
        canister_id: &CanisterId,
        scope: UpgradeScope,
    ) -> Result<StorageRecord, UpgradeError> {
        let record = self
            .orchestrator
            .upgrade_storage(caller, canister_id, scope)
            .await?;
        self.storage_deployer_running.store(true, Ordering::SeqCst);
        Ok(record)
    }

    pub async fn delete_storage(
        &self,
        caller: &Principal,
        id: u64,
    ) -> Result<(), DeleteStorageError> {
        self.orchestrator.delete_storage(caller, id).await
    }

    /// Whether storage records are being polled. Set when a creation or upgrade is
    /// accepted, cleared once no record has work left.
    pub fn is_storage_deployer_running(&self) -> bool {
        self.storage_deployer_running.load(Ordering::SeqCst)
    }

    /// One scheduling round: a chunk per pending download, an extraction step per
    /// pending archive, and a stage step per active storage record.
    pub async fn tick(&self) -> TickReport {
        let timer = crate::metrics::TickTimer::start();
        let (downloads, extractions) = tokio::join!(self.downloader.tick(), self.extractor.tick());

        let mut storages = 0;
        if self.is_storage_deployer_running() {
            storages = self.orchestrator.tick().await;
            self.stop_if_idle().await;
        }

        let report = TickReport {
            downloads,
            extractions,
            storages,
        };
        let elapsed = timer.stop();
        if !report.is_idle() {
            tracing::debug!("Tick {:?} took {:?}", report, elapsed);
        }
        report
    }

    async fn stop_if_idle(&self) {
        match self.registry.list_active().await {
            Ok(active) => {
                crate::metrics::set_active_storages(active.len());
                if !active.is_empty() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to count active storages: {}", e);
                return;
            }
        }

        self.storage_deployer_running.store(false, Ordering::SeqCst);
        // A record inserted between the count and the store above must not be stranded.
        if matches!(self.registry.list_active().await, Ok(active) if !active.is_empty()) {
            self.storage_deployer_running.store(true, Ordering::SeqCst);
        } else {
            tracing::info!("No storage deployments left, stopping storage deployer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedWorld;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let world = SimulatedWorld::new();
        let mut config = DeployerConfig::for_testing(dir.path());
        config.extract.max_bytes_per_step = 0;

        let result = Deployer::new(config, world.release_host(), world.collaborators()).await;
        assert!(matches!(result, Err(ServiceError::Config(ConfigError::Invalid(_)))));
    }

    #[tokio::test]
    async fn test_new_starts_idle() {
        let dir = TempDir::new().unwrap();
        let world = SimulatedWorld::new();
        let deployer = Deployer::new(
            DeployerConfig::for_testing(dir.path()),
            world.release_host(),
            world.collaborators(),
        )
        .await
        .unwrap();

        assert!(!deployer.is_storage_deployer_running());
        assert!(deployer.tick().await.is_idle());
    }
}
