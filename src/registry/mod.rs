pub mod error;
pub mod store;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use store::StorageRegistry;
pub use types::{
    CanisterId, CreationStatus, NewStorage, Principal, Progress, StageCursor, StorageRecord,
    StorageTarget, UpdateInfo, UpgradeJob, UpgradeScope,
};
