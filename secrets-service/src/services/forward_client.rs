//! HTTP client for the internal endpoints of other nodes.
//!
//! Every call carries the trace context and the originating request id so the
//! hop shows up in one trace.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use service_core::observability::PropagateTrace;
use std::time::Duration;
use tracing::instrument;

use crate::models::{AliasCreation, Entity, MfaCachedAuthResponse, Request, Response};
use crate::pipeline::{ForwardError, ForwardReply, ForwardingChannel};
use crate::services::CoreError;

pub const FORWARD_PATH: &str = "/internal/v1/forward";
pub const ALIAS_PATH: &str = "/internal/v1/identity/alias";
pub const ENTITY_PATH: &str = "/internal/v1/identity/entity";
pub const MFA_PATH: &str = "/internal/v1/mfa";
pub const CLUSTER_SECRET_HEADER: &str = "x-cluster-secret";

#[derive(Clone)]
pub struct HttpForwardingChannel {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    shared_secret: String,
}

impl HttpForwardingChannel {
    pub fn new(base_url: &str, timeout: Duration, shared_secret: &str) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to build forwarding client: {}", e)))?;

        tracing::info!(peer = %base_url, "Forwarding channel configured");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            shared_secret: shared_secret.to_string(),
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B, request_id: &str) -> Result<T, ForwardError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header(CLUSTER_SECRET_HEADER, &self.shared_secret)
            .json(body)
            .timeout(self.timeout)
            .propagate_trace(request_id)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ForwardError::Unreachable(e.to_string())
                } else {
                    ForwardError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url = %url, status = %status, "Peer rejected internal call");
            return Err(ForwardError::Transport(format!("peer answered {}", status)));
        }

        let reply: ForwardReply<T> = response
            .json()
            .await
            .map_err(|e| ForwardError::Transport(format!("unreadable peer reply: {}", e)))?;
        reply.into_result()
    }
}

#[async_trait]
impl ForwardingChannel for HttpForwardingChannel {
    #[instrument(skip_all, fields(request_id = %request.id, peer = %self.base_url))]
    async fn forward_request(&self, request: &Request) -> Result<Response, ForwardError> {
        self.post(FORWARD_PATH, request, &request.id).await
    }

    #[instrument(skip_all, fields(peer = %self.base_url))]
    async fn forward_alias_creation(
        &self,
        creation: &AliasCreation,
    ) -> Result<Entity, ForwardError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.post(ALIAS_PATH, creation, &request_id).await
    }

    #[instrument(skip_all, fields(peer = %self.base_url))]
    async fn forward_entity_creation(&self, entity: &Entity) -> Result<Entity, ForwardError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.post(ENTITY_PATH, entity, &request_id).await
    }

    #[instrument(skip_all, fields(peer = %self.base_url))]
    async fn forward_mfa_response(
        &self,
        entry: &MfaCachedAuthResponse,
    ) -> Result<(), ForwardError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.post(MFA_PATH, entry, &request_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Operation;

    #[tokio::test]
    async fn test_unreachable_peer_is_classified() {
        // Port 9 (discard) on localhost is closed in test environments
        let channel =
            HttpForwardingChannel::new("http://127.0.0.1:9/", Duration::from_millis(500), "secret")
                .unwrap();
        let err = channel
            .forward_request(&Request::new(Operation::Read, "kv/a"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ForwardError::Unreachable(_) | ForwardError::Transport(_)
        ));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let channel =
            HttpForwardingChannel::new("http://node-1:8200/", Duration::from_secs(1), "secret")
                .unwrap();
        assert_eq!(channel.base_url, "http://node-1:8200");
    }
}
