use thiserror::Error;

/// Failures talking to the release host
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Unknown asset: {0}")]
    UnknownAsset(String),
}

impl HostError {
    /// Whether repeating the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            HostError::Http(_) | HostError::ShortRead { .. } => true,
            HostError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            HostError::InvalidResponse(_) | HostError::UnknownAsset(_) => false,
        }
    }
}

impl From<reqwest::Error> for HostError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => HostError::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => HostError::Http(err.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("No deployment-ready release matches {0}")]
    ReleaseNotFound(String),

    #[error("Unknown asset: {0}")]
    AssetNotFound(String),

    #[error("Release host error: {0}")]
    Host(#[from] HostError),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sqlx::Error> for ReleaseError {
    fn from(err: sqlx::Error) -> Self {
        ReleaseError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for ReleaseError {
    fn from(err: serde_json::Error) -> Self {
        ReleaseError::SerializationError(err.to_string())
    }
}

pub type ReleaseResult<T> = Result<T, ReleaseError>;
