use crate::api::error::{ApiError, ApiResult};
use crate::api::types::*;
use crate::registry::{CanisterId, Principal};
use crate::release::{RefreshSummary, ReleasesFullStatus};
use crate::service::Deployer;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;

pub const CALLER_HEADER: &str = "x-caller";

/// Identity of the caller, taken from the `x-caller` header.
pub struct Caller(pub Principal);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Caller(Principal::new(value)))
            .ok_or(ApiError::MissingCaller)
    }
}

pub struct RestApi {
    deployer: Arc<Deployer>,
}

impl RestApi {
    pub fn new(deployer: Arc<Deployer>) -> Self {
        Self { deployer }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/api/v1/releases", get(get_releases_full_status))
            .route("/api/v1/releases/refresh", post(refresh_releases))
            .route("/api/v1/storages", post(create_storage).get(list_storages))
            // `:key` is a record id for DELETE and a canister id below it
            .route("/api/v1/storages/:key", delete(delete_storage))
            .route("/api/v1/storages/:key/update", get(check_storage_update))
            .route("/api/v1/storages/:key/upgrade", post(upgrade_storage))
            .route("/api/v1/deployer/running", get(is_storage_deployer_running))
            .route("/metrics", crate::metrics::metrics_route())
            .with_state(self.deployer.clone())
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn refresh_releases(
    State(deployer): State<Arc<Deployer>>,
) -> ApiResult<Json<RefreshSummary>> {
    Ok(Json(deployer.refresh_releases().await?))
}

async fn get_releases_full_status(
    State(deployer): State<Arc<Deployer>>,
) -> Json<ReleasesFullStatus> {
    Json(deployer.get_releases_full_status())
}

async fn create_storage(
    State(deployer): State<Arc<Deployer>>,
    Caller(caller): Caller,
    Json(req): Json<CreateStorageRequest>,
) -> ApiResult<(StatusCode, Json<StorageRecordResponse>)> {
    let record = deployer.create_storage(&caller, req.into()).await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

async fn list_storages(
    State(deployer): State<Arc<Deployer>>,
    Caller(caller): Caller,
) -> ApiResult<Json<ListStoragesResponse>> {
    let storages: Vec<StorageRecordResponse> = deployer
        .list_storages(&caller)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    let count = storages.len();
    Ok(Json(ListStoragesResponse { storages, count }))
}

async fn check_storage_update(
    State(deployer): State<Arc<Deployer>>,
    Path(canister_id): Path<String>,
) -> ApiResult<Json<Opt<crate::registry::UpdateInfo>>> {
    let info = deployer
        .check_storage_update(&CanisterId::new(canister_id))
        .await?;
    Ok(Json(info.into()))
}

async fn upgrade_storage(
    State(deployer): State<Arc<Deployer>>,
    Caller(caller): Caller,
    Path(canister_id): Path<String>,
    Json(req): Json<UpgradeStorageRequest>,
) -> ApiResult<Json<StorageRecordResponse>> {
    let record = deployer
        .upgrade_storage(&caller, &CanisterId::new(canister_id), req.scope)
        .await?;
    Ok(Json(record.into()))
}

async fn delete_storage(
    State(deployer): State<Arc<Deployer>>,
    Caller(caller): Caller,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    let id: u64 = key
        .parse()
        .map_err(|_| ApiError::InvalidRequest(format!("Invalid storage id: {key}")))?;
    deployer.delete_storage(&caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn is_storage_deployer_running(
    State(deployer): State<Arc<Deployer>>,
) -> Json<RunningResponse> {
    Json(RunningResponse {
        running: deployer.is_storage_deployer_running(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeployerConfig;
    use crate::sim::SimulatedWorld;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::Service;

    async fn create_test_api() -> (RestApi, SimulatedWorld, TempDir) {
        let dir = TempDir::new().unwrap();
        let world = SimulatedWorld::new();
        let deployer = Deployer::new(
            DeployerConfig::for_testing(dir.path()),
            world.release_host(),
            world.collaborators(),
        )
        .await
        .unwrap();
        (RestApi::new(Arc::new(deployer)), world, dir)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (api, _world, _dir) = create_test_api().await;
        let mut app = api.router();

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.call(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_refresh_then_status() {
        let (api, world, _dir) = create_test_api().await;
        world.publish_release("v1.0.0", false, false, 2048).unwrap();
        let mut app = api.router();

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/releases/refresh")
            .body(Body::empty())
            .unwrap();
        let response = app.call(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary: RefreshSummary = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(summary.added_releases, 1);

        let request = Request::builder().uri("/api/v1/releases").body(Body::empty()).unwrap();
        let response = app.call(request).await.unwrap();
        let status: ReleasesFullStatus = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(status.releases_count, 1);
        assert!(!status.has_deployment_ready_release);
    }

    #[tokio::test]
    async fn test_create_storage_requires_caller() {
        let (api, _world, _dir) = create_test_api().await;
        let mut app = api.router();

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/storages")
            .header("content-type", "application/json")
            .body(Body::from(r#"{ "target": { "Existing": { "canister_id": "x" } } }"#))
            .unwrap();
        let response = app.call(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "MISSING_CALLER");
    }

    #[tokio::test]
    async fn test_create_storage_without_release() {
        let (api, _world, _dir) = create_test_api().await;
        let mut app = api.router();

        let body = r#"{ "target": { "Create": { "initial_cycles": 1000000000000 } } }"#;
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/storages")
            .header(CALLER_HEADER, "alice")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = app.call(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "RELEASE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_list_storages_empty() {
        let (api, _world, _dir) = create_test_api().await;
        let mut app = api.router();

        let request = Request::builder()
            .uri("/api/v1/storages")
            .header(CALLER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let response = app.call(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let list: ListStoragesResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(list.count, 0);
    }

    #[tokio::test]
    async fn test_update_check_for_unknown_canister() {
        let (api, _world, _dir) = create_test_api().await;
        let mut app = api.router();

        let request = Request::builder()
            .uri("/api/v1/storages/unknown-cai/update")
            .body(Body::empty())
            .unwrap();
        let response = app.call(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_delete_unknown_storage() {
        let (api, _world, _dir) = create_test_api().await;
        let mut app = api.router();

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/v1/storages/42")
            .header(CALLER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let response = app.call(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/v1/storages/not-a-number")
            .header(CALLER_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let response = app.call(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_deployer_not_running_initially() {
        let (api, _world, _dir) = create_test_api().await;
        let mut app = api.router();

        let request = Request::builder()
            .uri("/api/v1/deployer/running")
            .body(Body::empty())
            .unwrap();
        let response = app.call(request).await.unwrap();
        let running: RunningResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert!(!running.running);
    }
}
