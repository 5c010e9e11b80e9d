//! Contracts of the external systems a deployment talks to.

use crate::deploy::error::PlatformError;
use crate::deploy::types::{AssetCommit, ConversionRate, InstallMode, Permission};
use crate::integrity::ContentHash;
use crate::registry::{CanisterId, Principal};
use async_trait::async_trait;
use bytes::Bytes;

/// Token ledger plus the minter that turns tokens into new instances.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Amount `spender` may move out of `owner`'s account
    async fn allowance(&self, owner: &Principal, spender: &Principal)
        -> Result<u128, PlatformError>;

    async fn transfer_fee(&self) -> Result<u128, PlatformError>;

    async fn conversion_rate(&self) -> Result<ConversionRate, PlatformError>;

    /// Move `amount` from `from` to the minter under `spender`'s allowance.
    ///
    /// A repeated call with the same `memo` returns the original block index.
    async fn transfer_from(
        &self,
        spender: &Principal,
        from: &Principal,
        amount: u128,
        memo: u64,
    ) -> Result<u64, PlatformError>;

    /// Turn the payment at `block_index` into a new instance controlled by `controller`.
    /// Idempotent per block index.
    async fn notify_create_canister(
        &self,
        block_index: u64,
        controller: &Principal,
        subnet_hint: Option<&str>,
    ) -> Result<CanisterId, PlatformError>;
}

/// Management interface of the compute platform.
#[async_trait]
pub trait ComputePlatform: Send + Sync {
    async fn clear_chunk_store(
        &self,
        caller: &Principal,
        canister: &CanisterId,
    ) -> Result<(), PlatformError>;

    /// Store one module chunk and return its hash
    async fn upload_chunk(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        chunk: Bytes,
    ) -> Result<ContentHash, PlatformError>;

    /// Assemble the module from stored chunks, in order, and install it.
    async fn install_chunked_code(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        mode: InstallMode,
        chunk_hashes: Vec<ContentHash>,
        module_hash: ContentHash,
        arg: Vec<u8>,
    ) -> Result<(), PlatformError>;

    async fn controllers(
        &self,
        caller: &Principal,
        canister: &CanisterId,
    ) -> Result<Vec<Principal>, PlatformError>;

    async fn update_controllers(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        controllers: Vec<Principal>,
    ) -> Result<(), PlatformError>;

    /// Hash of the installed module. Only controllers may ask.
    async fn module_hash(
        &self,
        caller: &Principal,
        canister: &CanisterId,
    ) -> Result<Option<ContentHash>, PlatformError>;
}

/// Interface exposed by an installed storage instance.
#[async_trait]
pub trait StorageInstance: Send + Sync {
    async fn create_batch(&self, caller: &Principal, canister: &CanisterId)
        -> Result<u64, PlatformError>;

    async fn create_chunk(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        batch_id: u64,
        content: Bytes,
    ) -> Result<u64, PlatformError>;

    /// Replace the served frontend with the batch's assets.
    async fn commit_batch(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        batch_id: u64,
        assets: Vec<AssetCommit>,
    ) -> Result<(), PlatformError>;

    /// Digest of the served frontend, `None` before the first commit
    async fn frontend_digest(&self, canister: &CanisterId)
        -> Result<Option<ContentHash>, PlatformError>;

    async fn create_entry(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        path: &str,
        content: Bytes,
    ) -> Result<(), PlatformError>;

    async fn update_entry(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        path: &str,
        content: Bytes,
    ) -> Result<(), PlatformError>;

    async fn delete_entry(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        path: &str,
    ) -> Result<(), PlatformError>;

    /// `entry` of `None` is the root; grants are inherited by descendants.
    async fn grant_permission(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        entry: Option<&str>,
        principal: &Principal,
        permission: Permission,
    ) -> Result<(), PlatformError>;

    async fn revoke_permission(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        entry: Option<&str>,
        principal: &Principal,
    ) -> Result<(), PlatformError>;

    async fn has_permission(
        &self,
        canister: &CanisterId,
        entry: Option<&str>,
        principal: &Principal,
        permission: Permission,
    ) -> Result<bool, PlatformError>;

    /// Explicit grants on `entry`
    async fn list_permitted(
        &self,
        canister: &CanisterId,
        entry: Option<&str>,
    ) -> Result<Vec<(Principal, Permission)>, PlatformError>;
}
