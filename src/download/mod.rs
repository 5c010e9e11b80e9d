pub mod blob;
pub mod downloader;
pub mod error;
pub mod in_flight;
pub mod rate_limiter;

pub use blob::BlobStore;
pub use downloader::{AssetDownloader, StepOutcome};
pub use error::{DownloadError, DownloadResult};
pub use in_flight::{FlightGuard, InFlight};
pub use rate_limiter::RequestRateLimiter;
