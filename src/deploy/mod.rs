pub mod error;
pub mod orchestrator;
pub mod payment;
pub mod platform;
pub mod state_machine;
pub mod types;
pub mod update_checker;

pub use error::{
    CreateStorageError, DeleteStorageError, DeployError, DeployResult, PlatformError, UpgradeError,
};
pub use orchestrator::{Collaborators, DeploymentOrchestrator};
pub use payment::PaymentQuote;
pub use platform::{ComputePlatform, PaymentGateway, StorageInstance};
pub use state_machine::CreationStateMachine;
pub use types::{AssetCommit, ConversionRate, CreateStorageOptions, InstallMode, Permission};
pub use update_checker::UpdateChecker;
