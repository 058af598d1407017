//! Forwarding dispatcher.
//!
//! Only the active node executes requests. Any other node either hands the
//! request to the active node and relays its answer untouched, or, when the
//! topology has no way to reach it, refuses the request outright. The active
//! node of a performance secondary additionally hands replicated writes to
//! the primary cluster.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use service_core::retry::{retry_call, RetryConfig, Retryable};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{NodeState, Outcome};
use crate::models::{AliasCreation, Entity, MfaCachedAuthResponse, Request, Response};
use crate::services::CoreError;

/// Why a call to another node did not produce that node's answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardError {
    /// The call never reached the peer; resending is safe.
    Unreachable(String),
    /// The call may have reached the peer but no answer came back.
    Transport(String),
    /// The peer answered with an error; relayed as-is.
    Remote(CoreError),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::Unreachable(msg) => write!(f, "peer unreachable: {}", msg),
            ForwardError::Transport(msg) => write!(f, "transport failure: {}", msg),
            ForwardError::Remote(err) => write!(f, "remote error: {}", err),
        }
    }
}

impl Retryable for ForwardError {
    fn is_retryable(&self) -> bool {
        matches!(self, ForwardError::Unreachable(_))
    }
}

impl From<ForwardError> for CoreError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Remote(remote) => remote,
            other => CoreError::ForwardingFailed(other.to_string()),
        }
    }
}

/// Body of every internal endpoint reply: the peer's value or the peer's error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardReply<T> {
    Ok(T),
    Err(CoreError),
}

impl<T> From<Result<T, CoreError>> for ForwardReply<T> {
    fn from(result: Result<T, CoreError>) -> Self {
        match result {
            Ok(value) => ForwardReply::Ok(value),
            Err(err) => ForwardReply::Err(err),
        }
    }
}

impl<T> ForwardReply<T> {
    pub fn into_result(self) -> Result<T, ForwardError> {
        match self {
            ForwardReply::Ok(value) => Ok(value),
            ForwardReply::Err(err) => Err(ForwardError::Remote(err)),
        }
    }
}

/// Inter-node channel to the node that owns the write.
#[async_trait]
pub trait ForwardingChannel: Send + Sync {
    async fn forward_request(&self, request: &Request) -> Result<Response, ForwardError>;
    async fn forward_alias_creation(&self, creation: &AliasCreation)
        -> Result<Entity, ForwardError>;
    async fn forward_entity_creation(&self, entity: &Entity) -> Result<Entity, ForwardError>;
    async fn forward_mfa_response(&self, entry: &MfaCachedAuthResponse)
        -> Result<(), ForwardError>;
}

/// A channel plus the deadline and retry budget every call through it gets.
#[derive(Clone)]
pub struct ForwardingClient {
    channel: Arc<dyn ForwardingChannel>,
    timeout: Duration,
    retry: RetryConfig,
}

impl ForwardingClient {
    pub fn new(channel: Arc<dyn ForwardingChannel>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            channel,
            timeout,
            retry: RetryConfig::quick(max_retries),
        }
    }

    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn ForwardingChannel>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ForwardError>>,
    {
        let timeout = self.timeout;
        let result = retry_call(&self.retry, operation, || {
            let attempt = f(self.channel.clone());
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(ForwardError::Transport(format!(
                        "no reply within {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        })
        .await;
        result.map_err(CoreError::from)
    }

    pub async fn forward_request(&self, request: &Request) -> Result<Response, CoreError> {
        self.call("forward_request", |channel| {
            let request = request.clone();
            async move { channel.forward_request(&request).await }
        })
        .await
    }

    pub async fn forward_alias_creation(&self, creation: &AliasCreation) -> Result<Entity, CoreError> {
        self.call("forward_alias_creation", |channel| {
            let creation = creation.clone();
            async move { channel.forward_alias_creation(&creation).await }
        })
        .await
    }

    pub async fn forward_entity_creation(&self, entity: &Entity) -> Result<Entity, CoreError> {
        self.call("forward_entity_creation", |channel| {
            let entity = entity.clone();
            async move { channel.forward_entity_creation(&entity).await }
        })
        .await
    }

    pub async fn forward_mfa_response(&self, entry: &MfaCachedAuthResponse) -> Result<(), CoreError> {
        self.call("forward_mfa_response", |channel| {
            let entry = entry.clone();
            async move { channel.forward_mfa_response(&entry).await }
        })
        .await
    }
}

#[async_trait]
pub trait ForwardingDispatcher: Send + Sync {
    fn state(&self) -> &NodeState;

    /// Whether this topology can reach the active node at all.
    fn could_forward(&self) -> bool;

    /// Hand `request` to the active node of this cluster.
    async fn forward(&self, request: &Request) -> Result<Response, CoreError>;

    /// Hand a write to the primary cluster.
    async fn forward_to_primary(&self, _request: &Request) -> Result<Response, CoreError> {
        Err(CoreError::ForwardingUnsupported(format!(
            "node {} has no primary cluster to forward writes to",
            self.state().node_id()
        )))
    }

    /// The request may not run here: this node is not active and the path
    /// is not one every node answers for itself.
    fn should_forward(&self, request: &Request) -> bool {
        !self.state().is_active() && !request.is_local_only()
    }

    /// Replicated writes on a performance secondary belong to the primary
    /// cluster. Logins and `sys/` paths stay here; a login's identity writes
    /// travel on their own.
    fn should_forward_to_primary(&self, request: &Request) -> bool {
        let state = self.state();
        state.is_active()
            && state.is_performance_secondary()
            && request.operation.is_write()
            && !request.is_login()
            && !request.is_local_only()
            && !request.path.starts_with("sys/")
    }

    /// A local attempt failed in a way another node can still serve: the
    /// active node changed, or the backend refused a write as read-only.
    fn should_forward_after(&self, request: &Request, err: &CoreError) -> bool {
        if request.is_local_only() {
            return false;
        }
        match err {
            CoreError::NotActiveNode => self.could_forward(),
            CoreError::ReadOnly(_) => self.state().is_performance_secondary(),
            _ => false,
        }
    }

    /// Forward to whichever node can serve a request that failed with `err`.
    async fn forward_after(&self, request: &Request, err: &CoreError) -> Result<Response, CoreError> {
        match err {
            CoreError::ReadOnly(_) => self.forward_to_primary(request).await,
            _ => self.forward(request).await,
        }
    }

    async fn possibly_forward(&self, request: &Request) -> Result<Outcome<Response>, CoreError> {
        if self.should_forward_to_primary(request) {
            return self.forward_to_primary(request).await.map(Outcome::Applied);
        }
        if !self.should_forward(request) {
            return Ok(Outcome::NotApplicable);
        }
        if !self.could_forward() {
            return Err(CoreError::ForwardingUnsupported(format!(
                "node {} is not active and cannot reach the active node",
                self.state().node_id()
            )));
        }
        self.forward(request).await.map(Outcome::Applied)
    }
}

/// Standalone topology: there is nobody to forward to.
pub struct StandaloneDispatcher {
    state: Arc<NodeState>,
}

impl StandaloneDispatcher {
    pub fn new(state: Arc<NodeState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ForwardingDispatcher for StandaloneDispatcher {
    fn state(&self) -> &NodeState {
        &self.state
    }

    fn could_forward(&self) -> bool {
        false
    }

    async fn forward(&self, _request: &Request) -> Result<Response, CoreError> {
        Err(CoreError::ForwardingUnsupported(
            "standalone node has no active node to forward to".to_string(),
        ))
    }
}

pub struct ClusterDispatcher {
    state: Arc<NodeState>,
    active: Option<ForwardingClient>,
    primary: Option<ForwardingClient>,
}

impl ClusterDispatcher {
    pub fn new(
        state: Arc<NodeState>,
        active: Option<ForwardingClient>,
        primary: Option<ForwardingClient>,
    ) -> Self {
        Self {
            state,
            active,
            primary,
        }
    }
}

#[async_trait]
impl ForwardingDispatcher for ClusterDispatcher {
    fn state(&self) -> &NodeState {
        &self.state
    }

    fn could_forward(&self) -> bool {
        self.active.is_some()
    }

    async fn forward(&self, request: &Request) -> Result<Response, CoreError> {
        let Some(client) = &self.active else {
            return Err(CoreError::ForwardingUnsupported(
                "no forwarding channel configured".to_string(),
            ));
        };

        tracing::info!(
            request_id = %request.id,
            path = %request.path,
            "Forwarding request to active node"
        );
        metrics::counter!(crate::services::metrics::PIPELINE_FORWARDED_TOTAL, "target" => "active")
            .increment(1);

        client.forward_request(request).await
    }

    async fn forward_to_primary(&self, request: &Request) -> Result<Response, CoreError> {
        let Some(client) = &self.primary else {
            return Err(CoreError::ForwardingUnsupported(format!(
                "performance secondary {} has no primary cluster channel",
                self.state.node_id()
            )));
        };

        tracing::info!(
            request_id = %request.id,
            path = %request.path,
            "Forwarding write to primary cluster"
        );
        metrics::counter!(crate::services::metrics::PIPELINE_FORWARDED_TOTAL, "target" => "primary")
            .increment(1);

        client.forward_request(request).await
    }
}
