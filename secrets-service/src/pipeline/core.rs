//! Request pipeline orchestrator.
//!
//! One entry point, [`Core::handle_request`], runs every request through the
//! same sequence: replication barrier, policy and control group gate,
//! forwarding, lockout check, execution, then identity, registration, MFA and
//! lockout bookkeeping for whatever the execution produced.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::control_group::{
    ControlGroupGate, DisabledControlGroupGate, GateOutcome, PersistentControlGroupGate,
};
use super::forwarding::{
    ClusterDispatcher, ForwardingChannel, ForwardingClient, ForwardingDispatcher,
    StandaloneDispatcher,
};
use super::identity::{ForwardedIdentityWrites, IdentityResolver, IdentityWrites, LocalIdentityWrites};
use super::lockout::LockoutTracker;
use super::mfa::{MfaCache, MfaValidator};
use super::registrar::Registrars;
use super::replication::{ClusterBarrier, ReplicationBarrier, ReplicationSource, StandaloneBarrier};
use super::{NodeContext, Outcome};
use crate::config::ClusterMode;
use crate::models::{
    Auth, ControlGroupRequest, Entity, FailedLoginUser, MfaCachedAuthResponse, Operation, Request,
    Response, SecretLease, TokenEntry,
};
use crate::services::metrics::{PIPELINE_REQUESTS_TOTAL, REGISTRATION_FAILURES_TOTAL};
use crate::services::{CoreError, LogicalBackend, PolicyDecision, PolicyEngine};

/// External systems the pipeline calls into.
pub struct Collaborators {
    pub policy: Arc<dyn PolicyEngine>,
    pub backend: Arc<dyn LogicalBackend>,
    pub replication: Option<Arc<dyn ReplicationSource>>,
    /// Channel to the active node of this cluster.
    pub active_channel: Option<Arc<dyn ForwardingChannel>>,
    /// Channel to the primary cluster, used by a performance secondary.
    pub primary_channel: Option<Arc<dyn ForwardingChannel>>,
    pub mfa_validator: Option<Arc<dyn MfaValidator>>,
}

impl Collaborators {
    pub fn new(policy: Arc<dyn PolicyEngine>, backend: Arc<dyn LogicalBackend>) -> Self {
        Self {
            policy,
            backend,
            replication: None,
            active_channel: None,
            primary_channel: None,
            mfa_validator: None,
        }
    }

    pub fn with_replication(mut self, source: Arc<dyn ReplicationSource>) -> Self {
        self.replication = Some(source);
        self
    }

    pub fn with_active_channel(mut self, channel: Arc<dyn ForwardingChannel>) -> Self {
        self.active_channel = Some(channel);
        self
    }

    pub fn with_primary_channel(mut self, channel: Arc<dyn ForwardingChannel>) -> Self {
        self.primary_channel = Some(channel);
        self
    }

    pub fn with_mfa_validator(mut self, validator: Arc<dyn MfaValidator>) -> Self {
        self.mfa_validator = Some(validator);
        self
    }
}

pub struct Core {
    ctx: NodeContext,
    policy: Arc<dyn PolicyEngine>,
    backend: Arc<dyn LogicalBackend>,
    barrier: Arc<dyn ReplicationBarrier>,
    gate: Arc<dyn ControlGroupGate>,
    dispatcher: Arc<dyn ForwardingDispatcher>,
    identity: IdentityResolver,
    registrars: Registrars,
    mfa: MfaCache,
    mfa_validator: Option<Arc<dyn MfaValidator>>,
    lockout: LockoutTracker,
}

impl Core {
    pub fn new(ctx: NodeContext, collaborators: Collaborators) -> Self {
        let config = ctx.config.clone();
        let state = ctx.state.clone();
        let client = |channel: &Option<Arc<dyn ForwardingChannel>>| {
            channel.clone().map(|channel| {
                ForwardingClient::new(
                    channel,
                    config.cluster.forward_timeout(),
                    config.cluster.forward_max_retries,
                )
            })
        };
        let active = client(&collaborators.active_channel);
        let primary = client(&collaborators.primary_channel);

        let (barrier, dispatcher, writes): (
            Arc<dyn ReplicationBarrier>,
            Arc<dyn ForwardingDispatcher>,
            Arc<dyn IdentityWrites>,
        ) = match config.cluster.mode {
            ClusterMode::Standalone => (
                Arc::new(StandaloneBarrier),
                Arc::new(StandaloneDispatcher::new(state.clone())),
                Arc::new(LocalIdentityWrites),
            ),
            ClusterMode::Clustered => {
                let barrier: Arc<dyn ReplicationBarrier> = match collaborators.replication {
                    Some(source) => Arc::new(ClusterBarrier::new(
                        source,
                        config.replication.wait_timeout(),
                    )),
                    None => {
                        tracing::warn!("No replication source configured; replication barrier disabled");
                        Arc::new(StandaloneBarrier)
                    }
                };
                (
                    barrier,
                    Arc::new(ClusterDispatcher::new(
                        state.clone(),
                        active.clone(),
                        primary.clone(),
                    )),
                    Arc::new(ForwardedIdentityWrites::new(state.clone(), active.clone(), primary)),
                )
            }
        };

        let gate: Arc<dyn ControlGroupGate> = if config.control_group.enabled {
            Arc::new(PersistentControlGroupGate::new(ctx.clone()))
        } else {
            Arc::new(DisabledControlGroupGate)
        };

        tracing::info!(
            node_id = %state.node_id(),
            mode = ?config.cluster.mode,
            role = ?state.role(),
            control_groups = config.control_group.enabled,
            "Request pipeline configured"
        );

        Self {
            identity: IdentityResolver::new(ctx.clone(), writes),
            registrars: Registrars::new(ctx.storage.clone(), state.is_active()),
            mfa: MfaCache::new(ctx.cache.clone(), state.clone(), active, config.mfa.cache_ttl()),
            lockout: LockoutTracker::new(ctx.cache.clone(), config.lockout.clone()),
            policy: collaborators.policy,
            backend: collaborators.backend,
            mfa_validator: collaborators.mfa_validator,
            barrier,
            gate,
            dispatcher,
            ctx,
        }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn registrars(&self) -> &Registrars {
        &self.registrars
    }

    pub fn lockout(&self) -> &LockoutTracker {
        &self.lockout
    }

    pub fn mfa(&self) -> &MfaCache {
        &self.mfa
    }

    pub fn gate(&self) -> &dyn ControlGroupGate {
        self.gate.as_ref()
    }

    /// Serve one client request. Cancelling `cancel` aborts any wait in progress.
    #[instrument(
        skip_all,
        fields(request_id = %request.id, path = %request.path, operation = request.operation.as_str())
    )]
    pub async fn handle_request(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response, CoreError> {
        let result = self.run(request, &cancel, false).await;
        Self::record_outcome(&result);
        result
    }

    /// Serve a request another node forwarded here. Never forwarded again.
    #[instrument(
        skip_all,
        fields(request_id = %request.id, path = %request.path, forwarded = true)
    )]
    pub async fn handle_forwarded_request(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<Response, CoreError> {
        let result = self.run(request, &cancel, true).await;
        Self::record_outcome(&result);
        result
    }

    /// Store an MFA result a standby handed over.
    pub async fn save_forwarded_mfa_response(
        &self,
        entry: &MfaCachedAuthResponse,
    ) -> Result<(), CoreError> {
        if !self.ctx.state.is_active() {
            return Err(CoreError::NotActiveNode);
        }
        self.mfa.save_locally(entry).await
    }

    pub async fn promote(&self) {
        if self.ctx.state.promote() {
            self.registrars.activate().await;
        }
    }

    pub async fn demote(&self) -> Result<(), CoreError> {
        if self.ctx.state.demote()? {
            self.registrars.deactivate().await;
        }
        Ok(())
    }

    async fn run(
        &self,
        mut request: Request,
        cancel: &CancellationToken,
        forwarded: bool,
    ) -> Result<Response, CoreError> {
        if let Outcome::Applied(state) = self
            .barrier
            .wait_for_replication_state(&request, cancel)
            .await?
        {
            tracing::debug!(index = state.index, "Replication barrier satisfied");
        }

        if request.is_local_only() {
            return self.node_status(&request);
        }

        // A presented token must be a registered one; only its absence is anonymous
        let token = match &request.client_token {
            Some(client_token) => match self.registrars.lookup_token(client_token).await? {
                Some(entry) => Some(entry),
                None => {
                    tracing::warn!("Request presented an unknown client token");
                    return Err(CoreError::PermissionDenied);
                }
            },
            None => None,
        };

        // Requests carrying control group state were evaluated when they were parked
        let decision = if request.control_group.is_some() || request.control_group_token.is_some() {
            PolicyDecision::Allowed
        } else {
            let entity_id = token.as_ref().and_then(|t| t.entity_id.as_deref());
            match self.policy.evaluate(&request, entity_id).await? {
                PolicyDecision::Denied => return Err(CoreError::PermissionDenied),
                decision => decision,
            }
        };

        match self.gate.check_needs_cg(&request, decision).await? {
            Outcome::NotApplicable => {}
            Outcome::Applied(GateOutcome::Respond(response)) => return Ok(response),
            Outcome::Applied(GateOutcome::Release(released)) => {
                tracing::info!(
                    control_group = ?released.control_group.as_ref().map(|m| m.id.as_str()),
                    "Releasing approved request"
                );
                request = released;
            }
            Outcome::Applied(GateOutcome::Defer) => {
                tracing::debug!("Control group handling deferred to the active node");
            }
        }

        if forwarded {
            if !self.ctx.state.is_active() {
                return Err(CoreError::NotActiveNode);
            }
        } else {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                outcome = self.dispatcher.possibly_forward(&request) => outcome?,
            };
            if let Outcome::Applied(response) = outcome {
                return Ok(response);
            }
        }

        let login_user = request.login_user();
        if let Some(user) = &login_user {
            self.lockout.check_locked_out(user).await?;
        }

        let executed = if is_system_path(&request.path) {
            self.execute_system(&request, token.as_ref()).await
        } else {
            self.backend.execute(&request).await
        };

        let response = match executed {
            Ok(response) => response,
            Err(err) => {
                if !forwarded && self.dispatcher.should_forward_after(&request, &err) {
                    tracing::info!(error = %err, "Local attempt refused; forwarding");
                    return tokio::select! {
                        _ = cancel.cancelled() => Err(CoreError::Cancelled),
                        response = self.dispatcher.forward_after(&request, &err) => response,
                    };
                }
                self.note_failed_login(login_user.as_ref(), &err).await;
                return Err(err);
            }
        };

        match self.complete(&request, response).await {
            Ok(response) => {
                if let Some(user) = &login_user {
                    if let Err(e) = self.lockout.record_successful_login(user).await {
                        tracing::warn!(error = %e, "Failed to clear login failures");
                    }
                }
                Ok(response)
            }
            Err(err) => {
                self.note_failed_login(login_user.as_ref(), &err).await;
                Err(err)
            }
        }
    }

    /// Identity, registration and MFA bookkeeping for a successful execution.
    async fn complete(&self, request: &Request, mut response: Response) -> Result<Response, CoreError> {
        let mut fresh_accessor = None;

        if let Some(auth) = response.auth.take() {
            let (auth, fresh) = self
                .complete_login(request, auth, response.secret.as_ref())
                .await?;
            if fresh {
                fresh_accessor = Some(auth.accessor.clone());
            }
            response.auth = Some(auth);
        }

        if let Some(mut secret) = response.secret.take() {
            if secret.lease_id.is_none() {
                let source = request.path.split('/').next().unwrap_or_default().to_string();
                let registered = match self.registrars.get_lease_register_func().await {
                    Ok(register) => register(request, &secret, &source).await,
                    Err(e) => Err(e),
                };
                match registered {
                    Ok(lease_id) => secret.lease_id = Some(lease_id),
                    Err(err) => {
                        return Err(self
                            .registration_failed(request, err, Some(&secret), fresh_accessor.as_deref())
                            .await)
                    }
                }
            }
            response.secret = Some(secret);
        }

        Ok(response)
    }

    /// Returns the auth to hand out and whether it was registered just now.
    async fn complete_login(
        &self,
        request: &Request,
        mut auth: Auth,
        secret: Option<&SecretLease>,
    ) -> Result<(Auth, bool), CoreError> {
        let mut validated = None;
        if auth.mfa_required {
            let fingerprint = request.fingerprint();
            if let Some(cached) = self.mfa.lookup(&fingerprint).await? {
                tracing::debug!("MFA satisfied by cached response");
                return Ok((cached, false));
            }
            match &self.mfa_validator {
                Some(validator) => validator.validate(request, &auth).await?,
                None => {
                    return Err(CoreError::MfaValidationFailed(
                        "no MFA method configured".to_string(),
                    ))
                }
            }
            validated = Some(fingerprint);
        }

        if let Outcome::Applied(entity) = self.identity.resolve(&auth).await? {
            auth.entity_id = Some(entity.id);
        }

        let registered = match self.registrars.get_auth_register_func().await {
            Ok(register) => register(request, &auth).await,
            Err(e) => Err(e),
        };
        if let Err(err) = registered {
            return Err(self.registration_failed(request, err, secret, None).await);
        }

        if let Some(fingerprint) = validated {
            let entry = MfaCachedAuthResponse::new(fingerprint, auth.clone());
            if let Err(e) = self.mfa.possibly_forward_save_cached_auth_response(&entry).await {
                tracing::warn!(error = %e, "Failed to cache MFA result");
            }
        }

        Ok((auth, true))
    }

    /// Undo what can be undone, then report the failure.
    async fn registration_failed(
        &self,
        request: &Request,
        err: CoreError,
        secret: Option<&SecretLease>,
        accessor: Option<&str>,
    ) -> CoreError {
        metrics::counter!(REGISTRATION_FAILURES_TOTAL).increment(1);
        tracing::error!(error = %err, "Registration failed; revoking issued grant");

        if let Some(accessor) = accessor {
            let revoked = match self.registrars.manager().await {
                Ok(manager) => manager.revoke_token(accessor).await,
                Err(e) => Err(e),
            };
            if let Err(e) = revoked {
                tracing::warn!(error = %e, accessor = %accessor, "Token cleanup failed");
            }
        }
        if let Some(secret) = secret {
            if let Err(e) = self.backend.revoke(request, secret).await {
                tracing::warn!(error = %e, "Secret cleanup failed");
            }
        }

        match err {
            CoreError::RegistrationFailed(_) => err,
            other => CoreError::RegistrationFailed(other.to_string()),
        }
    }

    async fn note_failed_login(&self, user: Option<&FailedLoginUser>, err: &CoreError) {
        let Some(user) = user else { return };
        if !matches!(
            err,
            CoreError::InvalidCredentials | CoreError::MfaValidationFailed(_)
        ) {
            return;
        }
        match self.lockout.record_failed_login(user).await {
            Ok(info) => tracing::info!(
                mount = %user.mount,
                user = %user.alias_name,
                failures = info.count,
                "Failed login recorded"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to record failed login"),
        }
    }

    fn node_status(&self, request: &Request) -> Result<Response, CoreError> {
        let state = &self.ctx.state;
        let config = &self.ctx.config;
        let data = match request.path.as_str() {
            "sys/health" => json!({
                "initialized": true,
                "sealed": self.barrier.sealed(),
                "standby": !state.is_active(),
                "performance_secondary": state.is_performance_secondary(),
                "node_id": state.node_id(),
                "version": config.service_version,
            }),
            "sys/leader" => json!({
                "ha_enabled": state.mode() == ClusterMode::Clustered,
                "is_self": state.is_active(),
                "leader_address": if state.is_active() {
                    None
                } else {
                    config.cluster.active_node_addr.clone()
                },
            }),
            "sys/seal-status" => json!({ "sealed": self.barrier.sealed() }),
            other => return Err(CoreError::UnsupportedPath(other.to_string())),
        };
        Ok(Response::with_data(into_map(data)))
    }

    async fn execute_system(
        &self,
        request: &Request,
        token: Option<&TokenEntry>,
    ) -> Result<Response, CoreError> {
        let path = request.path.as_str();
        match (request.operation, path) {
            (op, "sys/control-group/authorize") if op.is_write() => {
                let cg = self
                    .gate
                    .authorize(required_str(request, "id")?, &approver(token)?)
                    .await?;
                Ok(control_group_response(&cg))
            }
            (op, "sys/control-group/deny") if op.is_write() => {
                let cg = self
                    .gate
                    .deny(required_str(request, "id")?, &approver(token)?)
                    .await?;
                Ok(control_group_response(&cg))
            }
            (Operation::Read, _) if path.starts_with("sys/control-group/request/") => {
                let id = &path["sys/control-group/request/".len()..];
                Ok(control_group_response(&self.gate.status(id).await?))
            }
            (op, "identity/entity/merge") if op.is_write() => {
                let entity = self
                    .identity
                    .merge_entities(
                        required_str(request, "from_entity_id")?,
                        required_str(request, "to_entity_id")?,
                    )
                    .await?;
                Ok(entity_response(&entity))
            }
            (Operation::Read, _) if path.starts_with("identity/entity/id/") => {
                let id = &path["identity/entity/id/".len()..];
                self.identity
                    .read_entity(id)
                    .await?
                    .map(|entity| entity_response(&entity))
                    .ok_or_else(|| CoreError::UnsupportedPath(path.to_string()))
            }
            _ => Err(CoreError::UnsupportedPath(path.to_string())),
        }
    }

    fn record_outcome(result: &Result<Response, CoreError>) {
        let outcome = match result {
            Ok(response) if response.is_control_group_pending() => {
                tracing::info!("Request pending control group approval");
                "control_group_pending"
            }
            Ok(_) => {
                tracing::debug!("Request completed");
                "ok"
            }
            Err(err) => {
                if err.is_terminal() {
                    tracing::warn!(error = %err, class = err.class(), "Request failed");
                } else {
                    tracing::info!(
                        error = %err,
                        class = err.class(),
                        retryable = err.is_retryable(),
                        "Request failed"
                    );
                }
                err.class()
            }
        };
        metrics::counter!(PIPELINE_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
    }
}

fn is_system_path(path: &str) -> bool {
    path.starts_with("sys/") || path.starts_with("identity/")
}

fn required_str<'a>(request: &'a Request, key: &str) -> Result<&'a str, CoreError> {
    request
        .data
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::InvalidRequest(format!("missing required field '{}'", key)))
}

fn approver(token: Option<&TokenEntry>) -> Result<String, CoreError> {
    token
        .map(|t| t.entity_id.clone().unwrap_or_else(|| t.accessor.clone()))
        .ok_or(CoreError::PermissionDenied)
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn control_group_response(cg: &ControlGroupRequest) -> Response {
    let approvers: Vec<&str> = cg.approvals.iter().map(|a| a.approver.as_str()).collect();
    Response::with_data(into_map(json!({
        "id": cg.id,
        "status": cg.status(),
        "path": cg.request.path,
        "operation": cg.request.operation,
        "approvals": approvers,
        "required_approvals": cg.required_approvals,
        "denied_by": cg.denied_by,
        "created_at": cg.created_at,
        "expires_at": cg.expires_at(),
        "redeemed": cg.redeemed_at.is_some(),
    })))
}

fn entity_response(entity: &Entity) -> Response {
    Response::with_data(into_map(serde_json::to_value(entity).unwrap_or_default()))
}
