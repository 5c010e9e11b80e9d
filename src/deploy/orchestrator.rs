use crate::chunk::{ChunkPlan, ChunkSpec};
use crate::config::DeployConfig;
use crate::deploy::error::{CreateStorageError, DeleteStorageError, DeployResult, UpgradeError};
use crate::deploy::payment::PaymentQuote;
use crate::deploy::platform::{ComputePlatform, PaymentGateway, StorageInstance};
use crate::deploy::state_machine::CreationStateMachine;
use crate::deploy::types::{AssetCommit, CreateStorageOptions, InstallMode, Permission};
use crate::deploy::update_checker::UpdateChecker;
use crate::download::BlobStore;
use crate::integrity::ContentHash;
use crate::registry::{
    CanisterId, CreationStatus, NewStorage, Principal, Progress, StageCursor, StorageRecord,
    StorageRegistry, StorageTarget, UpgradeJob, UpgradeScope,
};
use crate::release::{AssetKey, AssetKind, FileManifestEntry, Release, ReleaseCatalog};
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// The external systems a deployment talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn PaymentGateway>,
    pub platform: Arc<dyn ComputePlatform>,
    pub storage: Arc<dyn StorageInstance>,
}

/// Result of one stage step.
enum Step {
    /// Nothing to do this tick
    Wait,
    Next(CreationStatus),
    Fail(CreateStorageError),
}

/// Frontend content of a release, ready to be chunked.
struct FrontendSource {
    path: PathBuf,
    files: Vec<FileManifestEntry>,
    digest: ContentHash,
}

/// Drives storage records through payment, install, upload and handover.
///
/// Every call to [`tick`](Self::tick) advances each active record by at most one
/// stage step. Chunked stages keep their resume point in the registry cursor, so a
/// restarted process picks up where the last committed chunk left off.
pub struct DeploymentOrchestrator {
    registry: Arc<StorageRegistry>,
    catalog: Arc<ReleaseCatalog>,
    blobs: BlobStore,
    collaborators: Collaborators,
    checker: Arc<UpdateChecker>,
    config: DeployConfig,
    installer: Principal,
    creation_lock: Mutex<()>,
    record_locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl DeploymentOrchestrator {
    pub fn new(
        registry: Arc<StorageRegistry>,
        catalog: Arc<ReleaseCatalog>,
        blobs: BlobStore,
        collaborators: Collaborators,
        checker: Arc<UpdateChecker>,
        config: DeployConfig,
    ) -> Self {
        let installer = Principal::new(config.installer.clone());
        Self {
            registry,
            catalog,
            blobs,
            collaborators,
            checker,
            config,
            installer,
            creation_lock: Mutex::new(()),
            record_locks: DashMap::new(),
        }
    }

    pub fn installer(&self) -> &Principal {
        &self.installer
    }

    pub async fn create_storage(
        &self,
        caller: &Principal,
        options: CreateStorageOptions,
    ) -> Result<StorageRecord, CreateStorageError> {
        let _guard = self.creation_lock.lock().await;

        if let Some(existing) = self
            .registry
            .list_by_owner(caller)
            .await?
            .into_iter()
            .find(|r| !r.status.is_terminal())
        {
            return Err(CreateStorageError::AlreadyInProgress(existing.id));
        }

        if let StorageTarget::Existing { canister_id } = &options.target {
            if self.registry.find_by_canister(canister_id).await?.is_some() {
                return Err(CreateStorageError::CanisterAlreadyUsed(canister_id.clone()));
            }
        }

        let selector = options
            .release_selector
            .unwrap_or_else(|| self.config.default_selector.clone());
        let release = self
            .catalog
            .select(&selector)
            .map_err(|_| CreateStorageError::ReleaseNotFound(selector.to_string()))?;

        let canister_id = match &options.target {
            StorageTarget::Existing { canister_id } => Some(canister_id.clone()),
            StorageTarget::Create { .. } => None,
        };

        let record = self
            .registry
            .insert(NewStorage {
                owner: caller.clone(),
                canister_id,
                release_tag: release.tag_name.clone(),
                release_selector: selector,
                target: options.target,
                init_arg: options.init_arg.unwrap_or_default(),
            })
            .await?;

        tracing::info!(
            "Storage {} created for {} with release {}",
            record.id,
            caller,
            record.release_tag
        );
        crate::metrics::record_deployment_started();
        Ok(record)
    }

    pub async fn upgrade_storage(
        &self,
        caller: &Principal,
        canister_id: &CanisterId,
        scope: UpgradeScope,
    ) -> Result<StorageRecord, UpgradeError> {
        let record = self
            .registry
            .find_by_canister(canister_id)
            .await?
            .filter(|r| &r.owner == caller && !r.status.is_failed())
            .ok_or(UpgradeError::NotFound)?;

        let lock = self.record_lock(record.id);
        let _guard = lock.lock().await;

        // Re-read under the lock; a tick may have moved it.
        let mut record = self
            .registry
            .get(record.id)
            .await?
            .ok_or(UpgradeError::NotFound)?;
        if record.is_upgrading() || !matches!(record.status, CreationStatus::Completed { .. }) {
            return Err(UpgradeError::AlreadyUpgrading);
        }

        let controllers = self
            .collaborators
            .platform
            .controllers(&self.installer, canister_id)
            .await
            .map_err(|e| UpgradeError::Internal(e.to_string()))?;
        if !controllers.contains(caller) {
            return Err(UpgradeError::NotOwner);
        }

        let info = self
            .checker
            .check_record(&record)
            .await?
            .ok_or(UpgradeError::NoUpdateAvailable)?;
        let install_wasm = scope.includes_wasm() && info.wasm_update_available;
        let upload_frontend = scope.includes_frontend() && info.frontend_update_available;
        if !install_wasm && !upload_frontend {
            return Err(UpgradeError::NoUpdateAvailable);
        }

        let release = self
            .catalog
            .select(&record.release_selector)
            .map_err(|_| UpgradeError::NoUpdateAvailable)?;
        let next = if install_wasm {
            CreationStatus::InstallingWasm {
                canister_id: canister_id.clone(),
                progress: Progress::new(0, self.module_plan(&release).map_or(0, |p| p.total())),
            }
        } else {
            let total = self
                .frontend_source(&release)
                .map_or(0, |source| self.frontend_plan(&source.files).total());
            CreationStatus::UploadingFrontend {
                canister_id: canister_id.clone(),
                progress: Progress::new(0, total),
            }
        };

        record.upgrade = Some(UpgradeJob {
            scope,
            release_tag: release.tag_name.clone(),
            install_wasm,
            upload_frontend,
            in_progress: true,
            last_error: None,
            started_at: chrono::Utc::now().timestamp(),
            finished_at: None,
        });
        CreationStateMachine::validate(&record.status, &next, true)?;
        record.status = next;
        self.registry.clear_cursor(record.id).await?;
        self.registry.save(&record).await?;

        tracing::info!(
            "Upgrade of storage {} to {} started ({:?})",
            record.id,
            release.tag_name,
            scope
        );
        crate::metrics::record_upgrade_started();
        Ok(record)
    }

    pub async fn delete_storage(
        &self,
        caller: &Principal,
        id: u64,
    ) -> Result<(), DeleteStorageError> {
        let lock = self.record_lock(id);
        let _guard = lock.lock().await;

        let record = self
            .registry
            .get(id)
            .await?
            .ok_or(DeleteStorageError::NotFound)?;
        if &record.owner != caller {
            return Err(DeleteStorageError::NotOwner);
        }
        if !record.status.is_failed() {
            return Err(DeleteStorageError::NotFailed);
        }

        self.registry.delete(id).await?;
        drop(_guard);
        self.record_locks.remove(&id);
        tracing::info!("Storage {} deleted", id);
        Ok(())
    }

    /// Advance every active record by one step. Returns how many records moved.
    pub async fn tick(&self) -> usize {
        let records = match self.registry.list_active().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Failed to list active storages: {}", e);
                return 0;
            }
        };

        let results = join_all(records.iter().map(|r| self.advance(r.id))).await;
        let mut advanced = 0;
        for (record, result) in records.iter().zip(results) {
            match result {
                Ok(true) => advanced += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Storage {} step deferred: {}", record.id, e),
            }
        }
        advanced
    }

    /// One step of one record. `false` when the record is busy, idle or waiting.
    pub async fn advance(&self, id: u64) -> DeployResult<bool> {
        let lock = self.record_lock(id);
        let Ok(_guard) = lock.try_lock() else {
            return Ok(false);
        };

        let Some(mut record) = self.registry.get(id).await? else {
            return Ok(false);
        };
        if !record.is_active() {
            return Ok(false);
        }

        match self.step(&record).await? {
            Step::Wait => Ok(false),
            Step::Next(next) => {
                self.apply(&mut record, next).await?;
                Ok(true)
            }
            Step::Fail(error) => {
                self.fail(&mut record, error).await?;
                Ok(true)
            }
        }
    }

    fn record_lock(&self, id: u64) -> Arc<Mutex<()>> {
        self.record_locks.entry(id).or_default().clone()
    }

    async fn step(&self, record: &StorageRecord) -> DeployResult<Step> {
        match &record.status {
            CreationStatus::Pending => Ok(Step::Next(match &record.target {
                StorageTarget::Create { .. } => CreationStatus::CheckingAllowance,
                StorageTarget::Existing { canister_id } => CreationStatus::CanisterCreated {
                    canister_id: canister_id.clone(),
                },
            })),
            CreationStatus::CheckingAllowance => Ok(self.check_allowance(record).await),
            CreationStatus::TransferringIcp { amount } => Ok(self.transfer(record, *amount).await),
            CreationStatus::NotifyingCmc { block_index } => {
                Ok(self.notify(record, *block_index).await)
            }
            CreationStatus::CanisterCreated { canister_id } => {
                self.prepare_install(record, canister_id).await
            }
            CreationStatus::InstallingWasm { canister_id, progress } => {
                self.install_wasm(record, canister_id, *progress).await
            }
            CreationStatus::UploadingFrontend { canister_id, progress } => {
                self.upload_frontend(record, canister_id, *progress).await
            }
            CreationStatus::UpdatingControllers { canister_id } => {
                Ok(self.update_controllers(record, canister_id).await)
            }
            CreationStatus::RevokingInstallerPermission { canister_id } => {
                Ok(self.revoke_installer(canister_id).await)
            }
            CreationStatus::Completed { .. } | CreationStatus::Failed { .. } => Ok(Step::Wait),
        }
    }

    async fn apply(&self, record: &mut StorageRecord, next: CreationStatus) -> DeployResult<()> {
        CreationStateMachine::validate(&record.status, &next, record.is_upgrading())?;

        if let Some(canister_id) = next.canister_id() {
            record.canister_id.get_or_insert_with(|| canister_id.clone());
        }

        if let CreationStatus::Completed { .. } = next {
            let now = chrono::Utc::now().timestamp();
            if let Some(job) = record.upgrade.as_mut().filter(|j| j.in_progress) {
                job.in_progress = false;
                job.finished_at = Some(now);
                job.last_error = None;
                record.release_tag = job.release_tag.clone();
                crate::metrics::record_upgrade_finished(true);
            } else {
                record.completed_at = Some(now);
                crate::metrics::record_deployment_completed();
            }
        }

        if record.status.label() != next.label() {
            tracing::info!(
                "Storage {}: {} -> {}",
                record.id,
                record.status.label(),
                next.label()
            );
        } else if let Some(progress) = next.progress() {
            tracing::debug!(
                "Storage {} {}: {}/{}",
                record.id,
                next.label(),
                progress.processed,
                progress.total
            );
        }

        record.status = next;
        self.registry.save(record).await?;
        Ok(())
    }

    async fn fail(
        &self,
        record: &mut StorageRecord,
        error: CreateStorageError,
    ) -> DeployResult<()> {
        let message = error.to_string();
        self.registry.clear_cursor(record.id).await?;

        match (record.upgrade.as_mut().filter(|j| j.in_progress), record.canister_id.clone()) {
            (Some(job), Some(canister_id)) => {
                tracing::warn!("Upgrade of storage {} failed: {}", record.id, message);
                job.in_progress = false;
                job.finished_at = Some(chrono::Utc::now().timestamp());
                job.last_error = Some(message);
                record.status = CreationStatus::Completed { canister_id };
                crate::metrics::record_upgrade_finished(false);
            }
            _ => {
                tracing::error!("Storage {} failed: {}", record.id, message);
                let next = CreationStatus::Failed { message };
                CreationStateMachine::validate(&record.status, &next, false)?;
                record.status = next;
                crate::metrics::record_deployment_failed();
            }
        }

        self.registry.save(record).await?;
        Ok(())
    }

    // -- payment ------------------------------------------------------------------------

    async fn check_allowance(&self, record: &StorageRecord) -> Step {
        let StorageTarget::Create { initial_cycles, .. } = &record.target else {
            return Step::Fail(CreateStorageError::Internal(
                "payment requested for an existing canister".into(),
            ));
        };

        let gateway = &self.collaborators.gateway;
        let quote = match tokio::try_join!(gateway.conversion_rate(), gateway.transfer_fee()) {
            Ok((rate, fee)) => PaymentQuote::compute(*initial_cycles, &self.config, &rate, fee),
            Err(e) => return Step::Fail(CreateStorageError::QuoteFailed(e.to_string())),
        };
        let Some(quote) = quote else {
            return Step::Fail(CreateStorageError::QuoteFailed(
                "conversion overflowed or rate is zero".into(),
            ));
        };

        match gateway.allowance(&record.owner, &self.installer).await {
            Ok(available) if available >= quote.required => {
                Step::Next(CreationStatus::TransferringIcp { amount: quote.amount })
            }
            Ok(available) => Step::Fail(CreateStorageError::InsufficientAllowance {
                available,
                required: quote.required,
            }),
            Err(e) => Step::Fail(CreateStorageError::QuoteFailed(e.to_string())),
        }
    }

    async fn transfer(&self, record: &StorageRecord, amount: u128) -> Step {
        match self
            .collaborators
            .gateway
            .transfer_from(&self.installer, &record.owner, amount, record.id)
            .await
        {
            Ok(block_index) => Step::Next(CreationStatus::NotifyingCmc { block_index }),
            Err(e) => Step::Fail(CreateStorageError::TransferFailed(e.to_string())),
        }
    }

    async fn notify(&self, record: &StorageRecord, block_index: u64) -> Step {
        let subnet_hint = match &record.target {
            StorageTarget::Create { subnet_hint, .. } => subnet_hint.as_deref(),
            StorageTarget::Existing { .. } => None,
        };
        match self
            .collaborators
            .gateway
            .notify_create_canister(block_index, &self.installer, subnet_hint)
            .await
        {
            Ok(canister_id) => Step::Next(CreationStatus::CanisterCreated { canister_id }),
            Err(e) => Step::Fail(CreateStorageError::NotifyFailed(e.to_string())),
        }
    }

    // -- module install -----------------------------------------------------------------

    fn target_release(&self, record: &StorageRecord) -> Option<Release> {
        let tag = match record.upgrade.as_ref().filter(|j| j.in_progress) {
            Some(job) => &job.release_tag,
            None => &record.release_tag,
        };
        self.catalog.get(tag).filter(Release::is_deployment_ready)
    }

    fn module_plan(&self, release: &Release) -> Option<ChunkPlan> {
        let module = release.module_asset()?;
        Some(ChunkPlan::for_len(module.size, self.config.upload_chunk_size as u64))
    }

    async fn prepare_install(
        &self,
        record: &StorageRecord,
        canister_id: &CanisterId,
    ) -> DeployResult<Step> {
        let Some(plan) = self.target_release(record).and_then(|r| self.module_plan(&r)) else {
            return Ok(Step::Wait);
        };

        let controllers = match self
            .collaborators
            .platform
            .controllers(&self.installer, canister_id)
            .await
        {
            Ok(controllers) => controllers,
            Err(e) => return Ok(Step::Fail(CreateStorageError::InstallFailed(e.to_string()))),
        };
        if !controllers.contains(&self.installer) {
            return Ok(Step::Fail(CreateStorageError::InstallFailed(format!(
                "{} is not a controller of {}",
                self.installer, canister_id
            ))));
        }
        if matches!(record.target, StorageTarget::Existing { .. })
            && !controllers.contains(&record.owner)
        {
            return Ok(Step::Fail(CreateStorageError::InstallFailed(format!(
                "{} is not a controller of {}",
                record.owner, canister_id
            ))));
        }

        self.registry.clear_cursor(record.id).await?;
        Ok(Step::Next(CreationStatus::InstallingWasm {
            canister_id: canister_id.clone(),
            progress: Progress::new(0, plan.total()),
        }))
    }

    async fn install_wasm(
        &self,
        record: &StorageRecord,
        canister_id: &CanisterId,
        progress: Progress,
    ) -> DeployResult<Step> {
        let Some(release) = self.target_release(record) else {
            return Ok(Step::Wait);
        };
        let (Some(module), Some(module_hash)) = (release.module_asset(), release.module_hash())
        else {
            return Ok(Step::Wait);
        };
        let path = self.blobs.path(&AssetKey::new(&release.tag_name, &module.name));
        let plan = ChunkPlan::for_len(module.size, self.config.upload_chunk_size as u64);
        let platform = self.collaborators.platform.clone();

        let mut cursor = self.registry.cursor(record.id).await?;
        if cursor.content_hash != Some(module_hash) {
            if cursor.content_hash.is_some() || progress.processed > 0 {
                return Ok(Step::Fail(CreateStorageError::InstallFailed(
                    "module changed during install".into(),
                )));
            }
            cursor = StageCursor {
                content_hash: Some(module_hash),
                ..StageCursor::default()
            };
        }

        if !cursor.chunk_store_cleared {
            if let Err(e) = platform.clear_chunk_store(&self.installer, canister_id).await {
                return Ok(Step::Fail(CreateStorageError::InstallFailed(e.to_string())));
            }
            cursor.chunk_store_cleared = true;
            self.registry.set_cursor(record.id, &cursor).await?;
        }

        let done = cursor.chunk_hashes.len() as u64;
        if done < plan.total() {
            let window = plan.window(done, self.config.upload_concurrency);
            let (hashes, error) = push_in_order(window, self.config.upload_concurrency, |spec| {
                let (path, platform) = (path.clone(), platform.clone());
                let (installer, canister_id) = (self.installer.clone(), canister_id.clone());
                async move {
                    let chunk = read_chunk(&path, 0, &spec).await?;
                    platform
                        .upload_chunk(&installer, &canister_id, chunk)
                        .await
                        .map_err(|e| e.to_string())
                }
            })
            .await;

            crate::metrics::record_chunks_pushed(hashes.len() as u64);
            cursor.chunk_hashes.extend(hashes);
            if let Some(message) = self.note_push_result(record.id, &mut cursor, error) {
                return Ok(Step::Fail(CreateStorageError::InstallFailed(message)));
            }
            self.registry.set_cursor(record.id, &cursor).await?;
            return Ok(Step::Next(CreationStatus::InstallingWasm {
                canister_id: canister_id.clone(),
                progress: Progress::new(cursor.chunk_hashes.len() as u64, plan.total()),
            }));
        }

        let mode = if record.is_upgrading() {
            InstallMode::Upgrade
        } else {
            match platform.module_hash(&self.installer, canister_id).await {
                Ok(Some(_)) => InstallMode::Reinstall,
                Ok(None) => InstallMode::Install,
                Err(e) => return Ok(Step::Fail(CreateStorageError::InstallFailed(e.to_string()))),
            }
        };

        if let Err(e) = platform
            .install_chunked_code(
                &self.installer,
                canister_id,
                mode,
                cursor.chunk_hashes,
                module_hash,
                record.init_arg.clone(),
            )
            .await
        {
            return Ok(Step::Fail(CreateStorageError::InstallFailed(e.to_string())));
        }
        self.registry.clear_cursor(record.id).await?;
        tracing::info!(
            "Installed {} on {} ({:?}, {} chunks)",
            module.name,
            canister_id,
            mode,
            plan.total()
        );

        let upload_frontend = record
            .upgrade
            .as_ref()
            .filter(|j| j.in_progress)
            .map_or(true, |j| j.upload_frontend);
        if !upload_frontend {
            return Ok(Step::Next(CreationStatus::Completed {
                canister_id: canister_id.clone(),
            }));
        }

        let total = self
            .frontend_source(&release)
            .map_or(0, |source| self.frontend_plan(&source.files).total());
        Ok(Step::Next(CreationStatus::UploadingFrontend {
            canister_id: canister_id.clone(),
            progress: Progress::new(0, total),
        }))
    }

    // -- frontend upload ----------------------------------------------------------------

    fn frontend_source(&self, release: &Release) -> Option<FrontendSource> {
        let asset = release.frontend_asset()?;
        let AssetKind::Archive(format) = asset.kind() else {
            return None;
        };
        Some(FrontendSource {
            path: self
                .blobs
                .archive_path(&AssetKey::new(&release.tag_name, &asset.name), format),
            files: release.frontend_files().into_iter().cloned().collect(),
            digest: release.frontend_digest()?,
        })
    }

    fn frontend_plan(&self, files: &[FileManifestEntry]) -> ChunkPlan {
        let sizes: Vec<u64> = files.iter().map(|f| f.size).collect();
        ChunkPlan::for_sources(&sizes, self.config.upload_chunk_size as u64)
    }

    fn after_frontend(&self, record: &StorageRecord, canister_id: &CanisterId) -> CreationStatus {
        if record.is_upgrading() {
            CreationStatus::Completed {
                canister_id: canister_id.clone(),
            }
        } else {
            CreationStatus::UpdatingControllers {
                canister_id: canister_id.clone(),
            }
        }
    }

    async fn upload_frontend(
        &self,
        record: &StorageRecord,
        canister_id: &CanisterId,
        progress: Progress,
    ) -> DeployResult<Step> {
        let Some(release) = self.target_release(record) else {
            return Ok(Step::Wait);
        };
        let Some(source) = self.frontend_source(&release) else {
            tracing::debug!("Release {} has no frontend, skipping upload", release.tag_name);
            return Ok(Step::Next(self.after_frontend(record, canister_id)));
        };
        let plan = self.frontend_plan(&source.files);
        let storage = self.collaborators.storage.clone();

        let mut cursor = self.registry.cursor(record.id).await?;
        if cursor.content_hash != Some(source.digest) {
            if cursor.content_hash.is_some() || progress.processed > 0 {
                return Ok(Step::Fail(CreateStorageError::UploadFailed(
                    "frontend changed during upload".into(),
                )));
            }
            cursor = StageCursor {
                content_hash: Some(source.digest),
                ..StageCursor::default()
            };
        }

        let batch_id = match cursor.batch_id {
            Some(batch_id) => batch_id,
            None => match storage.create_batch(&self.installer, canister_id).await {
                Ok(batch_id) => {
                    cursor.batch_id = Some(batch_id);
                    self.registry.set_cursor(record.id, &cursor).await?;
                    batch_id
                }
                Err(e) => return Ok(Step::Fail(CreateStorageError::UploadFailed(e.to_string()))),
            },
        };

        let done = cursor.chunk_ids.len() as u64;
        if done < plan.total() {
            let offsets: Vec<u64> = source.files.iter().map(|f| f.offset).collect();
            let window = plan.window(done, self.config.upload_concurrency);
            let (chunk_ids, error) = push_in_order(window, self.config.upload_concurrency, |spec| {
                let base = offsets.get(spec.source as usize).copied();
                let (path, storage) = (source.path.clone(), storage.clone());
                let (installer, canister_id) = (self.installer.clone(), canister_id.clone());
                async move {
                    let base =
                        base.ok_or_else(|| format!("no file for chunk {}", spec.order_index))?;
                    let content = read_chunk(&path, base, &spec).await?;
                    storage
                        .create_chunk(&installer, &canister_id, batch_id, content)
                        .await
                        .map_err(|e| e.to_string())
                }
            })
            .await;

            crate::metrics::record_chunks_pushed(chunk_ids.len() as u64);
            cursor.chunk_ids.extend(chunk_ids);
            if let Some(message) = self.note_push_result(record.id, &mut cursor, error) {
                return Ok(Step::Fail(CreateStorageError::UploadFailed(message)));
            }
            self.registry.set_cursor(record.id, &cursor).await?;
            return Ok(Step::Next(CreationStatus::UploadingFrontend {
                canister_id: canister_id.clone(),
                progress: Progress::new(cursor.chunk_ids.len() as u64, plan.total()),
            }));
        }

        let mut assets = Vec::with_capacity(source.files.len());
        for (index, file) in source.files.iter().enumerate() {
            let chunk_ids: Option<Vec<u64>> = plan
                .chunks_for_source(index as u32)
                .map(|spec| cursor.chunk_ids.get(spec.order_index as usize).copied())
                .collect();
            let Some(chunk_ids) = chunk_ids else {
                return Ok(Step::Fail(CreateStorageError::UploadFailed(format!(
                    "missing chunks for {}",
                    file.key
                ))));
            };
            assets.push(AssetCommit {
                key: file.asset_key(),
                content_type: file.content_type.clone(),
                sha256: file.sha256,
                chunk_ids,
            });
        }

        if let Err(e) = storage
            .commit_batch(&self.installer, canister_id, batch_id, assets)
            .await
        {
            return Ok(Step::Fail(CreateStorageError::UploadFailed(e.to_string())));
        }
        self.registry.clear_cursor(record.id).await?;
        tracing::info!(
            "Committed {} frontend files to {} (batch {})",
            source.files.len(),
            canister_id,
            batch_id
        );

        Ok(Step::Next(self.after_frontend(record, canister_id)))
    }

    /// Count a failed push round; `Some(message)` once the budget is spent.
    fn note_push_result(
        &self,
        id: u64,
        cursor: &mut StageCursor,
        error: Option<String>,
    ) -> Option<String> {
        let error = match error {
            Some(error) => error,
            None => {
                cursor.failures = 0;
                return None;
            }
        };

        cursor.failures += 1;
        if cursor.failures >= self.config.max_push_attempts {
            return Some(format!("{} (after {} attempts)", error, cursor.failures));
        }
        tracing::warn!(
            "Storage {} chunk push failed (attempt {}/{}): {}",
            id,
            cursor.failures,
            self.config.max_push_attempts,
            error
        );
        None
    }

    // -- handover -----------------------------------------------------------------------

    async fn update_controllers(&self, record: &StorageRecord, canister_id: &CanisterId) -> Step {
        let platform = &self.collaborators.platform;
        let mut controllers = match platform.controllers(&self.installer, canister_id).await {
            Ok(controllers) => controllers,
            Err(e) => return Step::Fail(CreateStorageError::ControllerUpdateFailed(e.to_string())),
        };
        for principal in [&record.owner, &self.installer] {
            if !controllers.contains(principal) {
                controllers.push(principal.clone());
            }
        }

        if let Err(e) = platform
            .update_controllers(&self.installer, canister_id, controllers)
            .await
        {
            return Step::Fail(CreateStorageError::ControllerUpdateFailed(e.to_string()));
        }

        if let Err(e) = self
            .collaborators
            .storage
            .grant_permission(
                &self.installer,
                canister_id,
                None,
                &record.owner,
                Permission::ReadWriteManage,
            )
            .await
        {
            return Step::Fail(CreateStorageError::PermissionUpdateFailed(e.to_string()));
        }

        if self.config.revoke_installer_permission {
            Step::Next(CreationStatus::RevokingInstallerPermission {
                canister_id: canister_id.clone(),
            })
        } else {
            Step::Next(CreationStatus::Completed {
                canister_id: canister_id.clone(),
            })
        }
    }

    async fn revoke_installer(&self, canister_id: &CanisterId) -> Step {
        match self
            .collaborators
            .storage
            .revoke_permission(&self.installer, canister_id, None, &self.installer)
            .await
        {
            Ok(()) => Step::Next(CreationStatus::Completed {
                canister_id: canister_id.clone(),
            }),
            Err(e) => Step::Fail(CreateStorageError::PermissionUpdateFailed(e.to_string())),
        }
    }
}

async fn read_chunk(path: &Path, base: u64, spec: &ChunkSpec) -> Result<Bytes, String> {
    if spec.len == 0 {
        return Ok(Bytes::new());
    }
    BlobStore::read_range(path, base + spec.offset, spec.len)
        .await
        .map_err(|e| format!("read {}: {}", path.display(), e))
}

/// Push a window of chunks concurrently and keep the results that form a contiguous
/// run from the start of the window. The first error, if any, is returned alongside.
async fn push_in_order<T, F, Fut>(
    window: &[ChunkSpec],
    concurrency: usize,
    push: F,
) -> (Vec<T>, Option<String>)
where
    F: Fn(ChunkSpec) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut results: Vec<(u32, Result<T, String>)> = stream::iter(window.iter().copied())
        .map(|spec| {
            let pushed = push(spec);
            async move { (spec.order_index, pushed.await) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(index, _)| *index);

    let mut committed = Vec::with_capacity(results.len());
    let mut error = None;
    for (_, result) in results {
        match result {
            Ok(value) if error.is_none() => committed.push(value),
            Ok(_) => {}
            Err(e) => {
                error.get_or_insert(e);
            }
        }
    }
    (committed, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(n: u32) -> Vec<ChunkSpec> {
        (0..n)
            .map(|i| ChunkSpec {
                order_index: i,
                source: 0,
                offset: i as u64 * 4,
                len: 4,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_push_in_order_keeps_window_order() {
        let window = specs(6);
        let (values, error) = push_in_order(&window, 3, |spec| async move {
            // Later chunks finish first.
            tokio::time::sleep(std::time::Duration::from_millis(6 - spec.order_index as u64)).await;
            Ok::<_, String>(spec.order_index)
        })
        .await;

        assert!(error.is_none());
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_push_in_order_stops_at_first_gap() {
        let window = specs(5);
        let (values, error) = push_in_order(&window, 5, |spec| async move {
            if spec.order_index == 2 {
                Err("boom".to_string())
            } else {
                Ok(spec.order_index)
            }
        })
        .await;

        assert_eq!(values, vec![0, 1]);
        assert_eq!(error.as_deref(), Some("boom"));
    }
}
