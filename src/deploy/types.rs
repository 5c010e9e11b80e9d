use crate::integrity::ContentHash;
use crate::registry::StorageTarget;
use crate::release::ReleaseSelector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStorageOptions {
    pub target: StorageTarget,
    /// Falls back to the configured default selector
    #[serde(default)]
    pub release_selector: Option<ReleaseSelector>,
    /// Argument passed to the module on install
    #[serde(default)]
    pub init_arg: Option<Vec<u8>>,
}

/// Token-to-resource exchange rate: `units * numerator / (overhead_constant * denominator)`
/// gives the token amount for `units` of compute resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRate {
    pub numerator: u128,
    pub denominator: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallMode {
    Install,
    Reinstall,
    Upgrade,
}

/// Data permission on a storage instance entry; higher levels include lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    Read,
    ReadWrite,
    ReadWriteManage,
}

/// One file of a frontend batch commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetCommit {
    pub key: String,
    pub content_type: String,
    pub sha256: ContentHash,
    /// Chunk ids in content order
    pub chunk_ids: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_order() {
        assert!(Permission::Read < Permission::ReadWrite);
        assert!(Permission::ReadWrite < Permission::ReadWriteManage);
    }
}
