mod error;
mod rest;
mod types;
mod websocket;

pub use error::{ApiError, ApiResult};
pub use rest::{Caller, RestApi, CALLER_HEADER};
pub use types::*;
pub use websocket::websocket_handler;

use crate::service::Deployer;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// REST routes plus the `/ws` progress stream
pub fn create_api_server(deployer: Arc<Deployer>) -> Router {
    let rest_api = RestApi::new(deployer.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ws_router = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(deployer);

    Router::new()
        .merge(rest_api.router())
        .merge(ws_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
