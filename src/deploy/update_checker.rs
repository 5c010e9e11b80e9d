use crate::deploy::error::DeployResult;
use crate::deploy::platform::{ComputePlatform, StorageInstance};
use crate::registry::{
    CanisterId, CreationStatus, Principal, StorageRecord, StorageRegistry, UpdateInfo,
};
use crate::release::ReleaseCatalog;
use std::sync::Arc;

/// Compares what an instance runs with what its selector currently resolves to.
///
/// Read-only: nothing here writes to the registry or the catalog.
pub struct UpdateChecker {
    registry: Arc<StorageRegistry>,
    catalog: Arc<ReleaseCatalog>,
    platform: Arc<dyn ComputePlatform>,
    storage: Arc<dyn StorageInstance>,
    installer: Principal,
}

impl UpdateChecker {
    pub fn new(
        registry: Arc<StorageRegistry>,
        catalog: Arc<ReleaseCatalog>,
        platform: Arc<dyn ComputePlatform>,
        storage: Arc<dyn StorageInstance>,
        installer: Principal,
    ) -> Self {
        Self {
            registry,
            catalog,
            platform,
            storage,
            installer,
        }
    }

    pub async fn check(&self, canister_id: &CanisterId) -> DeployResult<Option<UpdateInfo>> {
        match self.registry.find_by_canister(canister_id).await? {
            Some(record) => self.check_record(&record).await,
            None => Ok(None),
        }
    }

    pub async fn check_record(&self, record: &StorageRecord) -> DeployResult<Option<UpdateInfo>> {
        let deployed =
            matches!(record.status, CreationStatus::Completed { .. }) || record.is_upgrading();
        let Some(canister_id) = record.canister_id.as_ref().filter(|_| deployed) else {
            return Ok(None);
        };
        let Ok(release) = self.catalog.select(&record.release_selector) else {
            return Ok(None);
        };

        let current_wasm = self.platform.module_hash(&self.installer, canister_id).await?;
        let current_frontend = self.storage.frontend_digest(canister_id).await?;
        let available_wasm = release.module_hash();
        let available_frontend = release.frontend_digest();

        let wasm_update_available = available_wasm.is_some() && available_wasm != current_wasm;
        let frontend_update_available =
            available_frontend.is_some() && available_frontend != current_frontend;

        if !wasm_update_available && !frontend_update_available {
            return Ok(None);
        }

        Ok(Some(UpdateInfo {
            current_wasm_hash: current_wasm.map(|h| h.to_hex()),
            available_wasm_hash: available_wasm.map(|h| h.to_hex()),
            current_release_tag: Some(record.release_tag.clone()),
            available_release_tag: Some(release.tag_name.clone()),
            wasm_update_available,
            frontend_update_available,
        }))
    }
}
