use crate::integrity::ContentHash;
use crate::release::ReleaseSelector;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a caller or controller on the compute platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a storage instance on the compute platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanisterId(pub String);

impl CanisterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
}

impl Progress {
    pub fn new(processed: u64, total: u64) -> Self {
        Self { processed, total }
    }

    pub fn is_done(&self) -> bool {
        self.processed >= self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreationStatus {
    Pending,
    CheckingAllowance,
    TransferringIcp { amount: u128 },
    NotifyingCmc { block_index: u64 },
    CanisterCreated { canister_id: CanisterId },
    InstallingWasm { canister_id: CanisterId, progress: Progress },
    UploadingFrontend { canister_id: CanisterId, progress: Progress },
    UpdatingControllers { canister_id: CanisterId },
    RevokingInstallerPermission { canister_id: CanisterId },
    Completed { canister_id: CanisterId },
    Failed { message: String },
}

impl CreationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CreationStatus::Completed { .. } | CreationStatus::Failed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CreationStatus::Failed { .. })
    }

    pub fn canister_id(&self) -> Option<&CanisterId> {
        match self {
            CreationStatus::CanisterCreated { canister_id }
            | CreationStatus::InstallingWasm { canister_id, .. }
            | CreationStatus::UploadingFrontend { canister_id, .. }
            | CreationStatus::UpdatingControllers { canister_id }
            | CreationStatus::RevokingInstallerPermission { canister_id }
            | CreationStatus::Completed { canister_id } => Some(canister_id),
            _ => None,
        }
    }

    pub fn progress(&self) -> Option<Progress> {
        match self {
            CreationStatus::InstallingWasm { progress, .. }
            | CreationStatus::UploadingFrontend { progress, .. } => Some(*progress),
            _ => None,
        }
    }

    /// Position in the creation pipeline; `Failed` sorts last.
    pub fn stage(&self) -> u8 {
        match self {
            CreationStatus::Pending => 0,
            CreationStatus::CheckingAllowance => 1,
            CreationStatus::TransferringIcp { .. } => 2,
            CreationStatus::NotifyingCmc { .. } => 3,
            CreationStatus::CanisterCreated { .. } => 4,
            CreationStatus::InstallingWasm { .. } => 5,
            CreationStatus::UploadingFrontend { .. } => 6,
            CreationStatus::UpdatingControllers { .. } => 7,
            CreationStatus::RevokingInstallerPermission { .. } => 8,
            CreationStatus::Completed { .. } => 9,
            CreationStatus::Failed { .. } => 10,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CreationStatus::Pending => "pending",
            CreationStatus::CheckingAllowance => "checking_allowance",
            CreationStatus::TransferringIcp { .. } => "transferring_icp",
            CreationStatus::NotifyingCmc { .. } => "notifying_cmc",
            CreationStatus::CanisterCreated { .. } => "canister_created",
            CreationStatus::InstallingWasm { .. } => "installing_wasm",
            CreationStatus::UploadingFrontend { .. } => "uploading_frontend",
            CreationStatus::UpdatingControllers { .. } => "updating_controllers",
            CreationStatus::RevokingInstallerPermission { .. } => "revoking_installer_permission",
            CreationStatus::Completed { .. } => "completed",
            CreationStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageTarget {
    /// Pay for and create a fresh instance
    Create {
        initial_cycles: u128,
        subnet_hint: Option<String>,
    },
    /// Install onto an instance the caller already controls
    Existing { canister_id: CanisterId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeScope {
    WasmOnly,
    FrontendOnly,
    All,
}

impl UpgradeScope {
    pub fn includes_wasm(&self) -> bool {
        matches!(self, UpgradeScope::WasmOnly | UpgradeScope::All)
    }

    pub fn includes_frontend(&self) -> bool {
        matches!(self, UpgradeScope::FrontendOnly | UpgradeScope::All)
    }
}

/// An upgrade applied to a completed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeJob {
    pub scope: UpgradeScope,
    pub release_tag: String,
    pub install_wasm: bool,
    pub upload_frontend: bool,
    pub in_progress: bool,
    pub last_error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Drift between what an instance runs and what its selector resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub current_wasm_hash: Option<String>,
    pub available_wasm_hash: Option<String>,
    pub current_release_tag: Option<String>,
    pub available_release_tag: Option<String>,
    pub wasm_update_available: bool,
    pub frontend_update_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub id: u64,
    pub owner: Principal,
    pub canister_id: Option<CanisterId>,
    pub release_tag: String,
    pub release_selector: ReleaseSelector,
    pub target: StorageTarget,
    #[serde(default)]
    pub init_arg: Vec<u8>,
    pub status: CreationStatus,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub upgrade: Option<UpgradeJob>,
    /// Filled in when listing; never stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_available: Option<UpdateInfo>,
}

impl StorageRecord {
    pub fn is_upgrading(&self) -> bool {
        self.upgrade.as_ref().is_some_and(|u| u.in_progress)
    }

    /// Whether the scheduler still owes this record work
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal() || self.is_upgrading()
    }
}

/// Fields of a record before an id is assigned.
#[derive(Debug, Clone)]
pub struct NewStorage {
    pub owner: Principal,
    pub canister_id: Option<CanisterId>,
    pub release_tag: String,
    pub release_selector: ReleaseSelector,
    pub target: StorageTarget,
    pub init_arg: Vec<u8>,
}

/// Resume point of a chunked install or upload, stored beside the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCursor {
    /// Hash of the content being staged; a change means the release moved underneath
    pub content_hash: Option<ContentHash>,
    /// Module chunks accepted by the platform chunk store, in order
    pub chunk_hashes: Vec<ContentHash>,
    /// Frontend batch opened on the storage instance
    pub batch_id: Option<u64>,
    /// Frontend chunk ids, in order
    pub chunk_ids: Vec<u64>,
    /// Consecutive failed pushes
    pub failures: u32,
    pub chunk_store_cleared: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let id = CanisterId::new("aaaaa-aa");
        assert!(CreationStatus::Completed { canister_id: id.clone() }.is_terminal());
        assert!(CreationStatus::Failed { message: "x".into() }.is_terminal());
        assert!(!CreationStatus::CanisterCreated { canister_id: id }.is_terminal());
        assert!(!CreationStatus::Pending.is_terminal());
    }

    #[test]
    fn test_stage_order() {
        let id = CanisterId::new("aaaaa-aa");
        let stages = [
            CreationStatus::Pending,
            CreationStatus::CheckingAllowance,
            CreationStatus::TransferringIcp { amount: 1 },
            CreationStatus::NotifyingCmc { block_index: 1 },
            CreationStatus::CanisterCreated { canister_id: id.clone() },
            CreationStatus::InstallingWasm {
                canister_id: id.clone(),
                progress: Progress::default(),
            },
            CreationStatus::UploadingFrontend {
                canister_id: id.clone(),
                progress: Progress::default(),
            },
            CreationStatus::UpdatingControllers { canister_id: id.clone() },
            CreationStatus::RevokingInstallerPermission { canister_id: id.clone() },
            CreationStatus::Completed { canister_id: id },
        ];
        assert!(stages.windows(2).all(|w| w[0].stage() < w[1].stage()));
    }

    #[test]
    fn test_record_serialization_omits_projection() {
        let record = StorageRecord {
            id: 1,
            owner: Principal::new("alice"),
            canister_id: None,
            release_tag: "v1".into(),
            release_selector: ReleaseSelector::Latest,
            target: StorageTarget::Create {
                initial_cycles: 2_000_000_000_000,
                subnet_hint: None,
            },
            init_arg: vec![],
            status: CreationStatus::Pending,
            created_at: 0,
            completed_at: None,
            upgrade: None,
            update_available: None,
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("update_available"));
        let back: StorageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
