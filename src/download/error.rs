use crate::release::{HostError, ReleaseError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Release catalog error: {0}")]
    Catalog(#[from] ReleaseError),

    #[error("Release host error: {0}")]
    Host(#[from] HostError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] crate::integrity::IntegrityError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type DownloadResult<T> = Result<T, DownloadError>;
