pub mod catalog;
pub mod error;
pub mod host;
pub mod selector;
pub mod types;

pub use catalog::ReleaseCatalog;
pub use error::{HostError, ReleaseError, ReleaseResult};
pub use host::{GitHubReleaseHost, ReleaseHost, RemoteAsset, RemoteRelease};
pub use selector::ReleaseSelector;
pub use types::{
    ArchiveFormat, Asset, AssetFullStatus, AssetKey, AssetKind, DownloadStatus,
    ExtractionStatus, FileManifestEntry, RefreshSummary, Release, ReleaseFullStatus,
    ReleasesFullStatus, RetryState,
};
