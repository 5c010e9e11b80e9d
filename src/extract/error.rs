use crate::release::ReleaseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Corrupt archive header at offset {offset}: {reason}")]
    CorruptHeader { offset: u64, reason: String },

    #[error("Archive truncated at offset {0}")]
    Truncated(u64),

    #[error("Release catalog error: {0}")]
    Catalog(#[from] ReleaseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type ExtractResult<T> = Result<T, ExtractError>;
