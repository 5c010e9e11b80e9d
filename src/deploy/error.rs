use crate::registry::{CanisterId, RegistryError};
use crate::release::ReleaseError;
use thiserror::Error;

/// A call into an external collaborator was refused or could not be made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreateStorageError {
    #[error("A storage creation is already in progress (record {0})")]
    AlreadyInProgress(u64),

    #[error("Canister {0} is already linked to a storage record")]
    CanisterAlreadyUsed(CanisterId),

    #[error("No deployment-ready release for {0}")]
    ReleaseNotFound(String),

    #[error("Insufficient allowance: {available} available, {required} required")]
    InsufficientAllowance { available: u128, required: u128 },

    #[error("Payment quote failed: {0}")]
    QuoteFailed(String),

    #[error("Token transfer failed: {0}")]
    TransferFailed(String),

    #[error("Canister creation failed: {0}")]
    NotifyFailed(String),

    #[error("Module install failed: {0}")]
    InstallFailed(String),

    #[error("Frontend upload failed: {0}")]
    UploadFailed(String),

    #[error("Controller update failed: {0}")]
    ControllerUpdateFailed(String),

    #[error("Permission update failed: {0}")]
    PermissionUpdateFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("No storage found for this canister")]
    NotFound,

    #[error("Caller no longer controls the canister")]
    NotOwner,

    #[error("No update available")]
    NoUpdateAvailable,

    #[error("An operation is already in progress for this storage")]
    AlreadyUpgrading,

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeleteStorageError {
    #[error("Storage record not found")]
    NotFound,

    #[error("Caller does not own this storage record")]
    NotOwner,

    #[error("Only failed storage records can be deleted")]
    NotFailed,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures inside the orchestrator that leave a record untouched for the next tick.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Release error: {0}")]
    Release(#[from] ReleaseError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type DeployResult<T> = Result<T, DeployError>;

macro_rules! internal_from {
    ($target:ty) => {
        impl From<RegistryError> for $target {
            fn from(err: RegistryError) -> Self {
                Self::Internal(err.to_string())
            }
        }

        impl From<DeployError> for $target {
            fn from(err: DeployError) -> Self {
                Self::Internal(err.to_string())
            }
        }
    };
}

internal_from!(CreateStorageError);
internal_from!(UpgradeError);
internal_from!(DeleteStorageError);
