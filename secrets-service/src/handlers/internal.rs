//! Node-to-node endpoints. Every reply is a [`ForwardReply`] with status 200 so
//! the caller can relay the peer's error unchanged.

use axum::{
    extract::{Request as HttpRequest, State},
    http::HeaderMap,
    middleware::Next,
    response::Response as HttpResponse,
    Json,
};
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::models::{AliasCreation, Entity, MfaCachedAuthResponse, Request, Response};
use crate::pipeline::ForwardReply;
use crate::services::forward_client::CLUSTER_SECRET_HEADER;
use crate::AppState;

/// Rejects any call that does not present the cluster's shared secret.
pub async fn require_cluster_secret(
    State(state): State<AppState>,
    request: HttpRequest,
    next: Next,
) -> Result<HttpResponse, AppError> {
    let expected = state.core.context().config.cluster.shared_secret.as_deref();
    match expected {
        Some(secret) if presents_secret(request.headers(), secret) => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "Peer call without a valid cluster secret");
            Err(AppError::Unauthorized(anyhow::anyhow!("invalid cluster secret")))
        }
        None => Err(AppError::Forbidden(anyhow::anyhow!(
            "node-to-node endpoints are disabled without a cluster secret"
        ))),
    }
}

fn presents_secret(headers: &HeaderMap, secret: &str) -> bool {
    let Some(presented) = headers
        .get(CLUSTER_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    // Fixed-length digests: timing is independent of the secret length
    Sha256::digest(presented.as_bytes()) == Sha256::digest(secret.as_bytes())
}

pub async fn forward(
    State(state): State<AppState>,
    Json(request): Json<Request>,
) -> Json<ForwardReply<Response>> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    Json(state.core.handle_forwarded_request(request, cancel).await.into())
}

pub async fn create_alias(
    State(state): State<AppState>,
    Json(creation): Json<AliasCreation>,
) -> Json<ForwardReply<Entity>> {
    tracing::debug!(
        mount = %creation.alias.mount_accessor,
        name = %creation.alias.name,
        "Alias creation forwarded from peer"
    );
    Json(state.core.identity().create_alias(&creation).await.into())
}

pub async fn create_entity(
    State(state): State<AppState>,
    Json(entity): Json<Entity>,
) -> Json<ForwardReply<Entity>> {
    Json(state.core.identity().create_entity(&entity).await.into())
}

pub async fn save_mfa(
    State(state): State<AppState>,
    Json(entry): Json<MfaCachedAuthResponse>,
) -> Json<ForwardReply<()>> {
    Json(state.core.save_forwarded_mfa_response(&entry).await.into())
}
