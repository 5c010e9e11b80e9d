use crate::deploy::{CreateStorageError, DeleteStorageError, DeployError, UpgradeError};
use crate::release::ReleaseError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    CreateStorage(#[from] CreateStorageError),

    #[error("{0}")]
    Upgrade(#[from] UpgradeError),

    #[error("{0}")]
    DeleteStorage(#[from] DeleteStorageError),

    #[error("Release catalog error: {0}")]
    Release(#[from] ReleaseError),

    #[error("Deployer error: {0}")]
    Deploy(#[from] DeployError),

    #[error("Missing or empty x-caller header")]
    MissingCaller,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::CreateStorage(e) => match e {
                CreateStorageError::AlreadyInProgress(_) => {
                    (StatusCode::CONFLICT, "ALREADY_IN_PROGRESS")
                }
                CreateStorageError::CanisterAlreadyUsed(_) => {
                    (StatusCode::CONFLICT, "CANISTER_ALREADY_USED")
                }
                CreateStorageError::ReleaseNotFound(_) => {
                    (StatusCode::NOT_FOUND, "RELEASE_NOT_FOUND")
                }
                CreateStorageError::InsufficientAllowance { .. } => {
                    (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_ALLOWANCE")
                }
                CreateStorageError::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
                _ => (StatusCode::BAD_GATEWAY, "PROVISIONING_ERROR"),
            },
            ApiError::Upgrade(e) => match e {
                UpgradeError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                UpgradeError::NotOwner => (StatusCode::FORBIDDEN, "NOT_OWNER"),
                UpgradeError::NoUpdateAvailable => (StatusCode::CONFLICT, "NO_UPDATE_AVAILABLE"),
                UpgradeError::AlreadyUpgrading => (StatusCode::CONFLICT, "ALREADY_UPGRADING"),
                UpgradeError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            ApiError::DeleteStorage(e) => match e {
                DeleteStorageError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                DeleteStorageError::NotOwner => (StatusCode::FORBIDDEN, "NOT_OWNER"),
                DeleteStorageError::NotFailed => (StatusCode::CONFLICT, "NOT_FAILED"),
                DeleteStorageError::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
            ApiError::Release(ReleaseError::Host(_)) => {
                (StatusCode::BAD_GATEWAY, "RELEASE_HOST_ERROR")
            }
            ApiError::Release(_) | ApiError::Deploy(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
            ApiError::MissingCaller => (StatusCode::UNAUTHORIZED, "MISSING_CALLER"),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!("API error: {}", self);
        }

        let body = Json(json!({
            "error": self.to_string(),
            "code": error_code,
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
