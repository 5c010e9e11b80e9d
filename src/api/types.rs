use crate::deploy::CreateStorageOptions;
use crate::registry::{
    CanisterId, CreationStatus, Principal, Progress, StorageRecord, StorageTarget, UpdateInfo,
    UpgradeJob, UpgradeScope,
};
use crate::release::ReleaseSelector;
use serde::{Deserialize, Serialize};

/// Optional value on the wire: an empty list or a single element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Opt<T>(pub Vec<T>);

impl<T> Default for Opt<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Opt<T> {
    pub fn into_option(self) -> Option<T> {
        self.0.into_iter().next()
    }
}

impl<T> From<Option<T>> for Opt<T> {
    fn from(value: Option<T>) -> Self {
        Self(value.into_iter().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStorageRequest {
    pub target: StorageTarget,
    #[serde(default)]
    pub release_selector: Opt<ReleaseSelector>,
    #[serde(default)]
    pub init_arg: Opt<Vec<u8>>,
}

impl From<CreateStorageRequest> for CreateStorageOptions {
    fn from(req: CreateStorageRequest) -> Self {
        Self {
            target: req.target,
            release_selector: req.release_selector.into_option(),
            init_arg: req.init_arg.into_option(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeStorageRequest {
    pub scope: UpgradeScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRecordResponse {
    pub id: u64,
    pub owner: Principal,
    pub canister_id: Opt<CanisterId>,
    pub release_tag: String,
    pub release_selector: ReleaseSelector,
    pub status: CreationStatus,
    pub created_at: i64,
    pub completed_at: Opt<i64>,
    pub upgrade: Opt<UpgradeJob>,
    pub update_available: Opt<UpdateInfo>,
}

impl From<StorageRecord> for StorageRecordResponse {
    fn from(record: StorageRecord) -> Self {
        Self {
            id: record.id,
            owner: record.owner,
            canister_id: record.canister_id.into(),
            release_tag: record.release_tag,
            release_selector: record.release_selector,
            status: record.status,
            created_at: record.created_at,
            completed_at: record.completed_at.into(),
            upgrade: record.upgrade.into(),
            update_available: record.update_available.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListStoragesResponse {
    pub storages: Vec<StorageRecordResponse>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningResponse {
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageProgress {
    pub id: u64,
    pub owner: Principal,
    pub canister_id: Opt<CanisterId>,
    pub stage: String,
    pub status: CreationStatus,
    pub progress: Opt<Progress>,
    pub upgrading: bool,
}

impl From<&StorageRecord> for StorageProgress {
    fn from(record: &StorageRecord) -> Self {
        Self {
            id: record.id,
            owner: record.owner.clone(),
            canister_id: record.canister_id.clone().into(),
            stage: record.status.label().to_string(),
            status: record.status.clone(),
            progress: record.status.progress().into(),
            upgrading: record.is_upgrading(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub timestamp: u64,
    pub releases_count: u64,
    pub pending_downloads: u64,
    pub completed_downloads: u64,
    pub failed_downloads: u64,
    pub default_version_key: Opt<String>,
    pub storage_deployer_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WebSocketMessage {
    StorageProgress(StorageProgress),
    CatalogSnapshot(CatalogSnapshot),
    Error(ErrorResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opt_wire_shape() {
        let some: Opt<u32> = Some(7).into();
        let none: Opt<u32> = None.into();
        assert_eq!(serde_json::to_string(&some).unwrap(), "[7]");
        assert_eq!(serde_json::to_string(&none).unwrap(), "[]");
        assert_eq!(serde_json::from_str::<Opt<u32>>("[3]").unwrap().into_option(), Some(3));
    }

    #[test]
    fn test_create_request_defaults() {
        let req: CreateStorageRequest = serde_json::from_str(
            r#"{ "target": { "Existing": { "canister_id": "sim-00001-cai" } } }"#,
        )
        .unwrap();
        let options = CreateStorageOptions::from(req);
        assert_eq!(options.release_selector, None);
        assert_eq!(options.init_arg, None);
    }
}
