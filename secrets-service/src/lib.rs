pub mod config;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod services;

use service_core::axum::{
    extract::State,
    middleware::{from_fn, from_fn_with_state},
    routing::{any, get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::pipeline::Core;
use crate::services::forward_client::{ALIAS_PATH, ENTITY_PATH, FORWARD_PATH, MFA_PATH};

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
}

impl AppState {
    pub fn new(core: Core) -> Self {
        Self {
            core: Arc::new(core),
        }
    }
}

/// Client-facing listener.
pub fn build_router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/v1/*path", any(handlers::request::handle))
        .with_state(state);
    with_observability(routes)
}

/// Node-to-node listener, served only by clustered nodes. Every call must
/// carry the cluster's shared secret.
pub fn build_cluster_router(state: AppState) -> Router {
    let routes = Router::new()
        .route(FORWARD_PATH, post(handlers::internal::forward))
        .route(ALIAS_PATH, post(handlers::internal::create_alias))
        .route(ENTITY_PATH, post(handlers::internal::create_entity))
        .route(MFA_PATH, post(handlers::internal::save_mfa))
        .layer(from_fn_with_state(
            state.clone(),
            handlers::internal::require_cluster_secret,
        ))
        .with_state(state);
    with_observability(routes)
}

fn with_observability(routes: Router) -> Router {
    routes
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
}

pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctx = state.core.context();

    ctx.cache.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Cache health check failed");
        AppError::ServiceUnavailable(format!("cache unavailable: {}", e))
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": ctx.config.service_name,
        "version": ctx.config.service_version,
        "environment": format!("{:?}", ctx.config.environment),
        "node_id": ctx.state.node_id(),
        "role": format!("{:?}", ctx.state.role()),
        "mode": format!("{:?}", ctx.config.cluster.mode),
        "checks": {
            "cache": "up"
        }
    })))
}
