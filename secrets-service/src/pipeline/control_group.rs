//! Control group gate.
//!
//! Requests whose policy demands multi-party authorization are parked as a
//! stored [`ControlGroupRequest`]; the client gets a token back instead of the
//! result. Resubmitting with the token returns the current status until
//! enough approvers have signed off, then replays the original request once.

use async_trait::async_trait;
use chrono::Utc;

use super::{NodeContext, Outcome};
use crate::models::control_group::{control_group_fingerprint_key, control_group_storage_key};
use crate::models::{
    Approval, ControlGroupMarker, ControlGroupPending, ControlGroupRequest, ControlGroupStatus,
    Request, RequestFingerprint, Response,
};
use crate::services::policy::PolicyDecision;
use crate::services::storage::{get_json, put_json, put_op};
use crate::services::{CoreError, KeyedLocks};

const PENDING_WARNING: &str = "request requires control group authorization";

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Answer the client with this instead of running the request.
    Respond(Response),
    /// Run this request: the original one, released after approval.
    Release(Request),
    /// The next step needs a write only the active node may make.
    Defer,
}

#[async_trait]
pub trait ControlGroupGate: Send + Sync {
    /// `NotApplicable` when the request carries no control group state and
    /// its policy does not require one.
    async fn check_needs_cg(
        &self,
        request: &Request,
        decision: PolicyDecision,
    ) -> Result<Outcome<GateOutcome>, CoreError>;

    async fn authorize(&self, id: &str, approver: &str) -> Result<ControlGroupRequest, CoreError>;

    async fn deny(&self, id: &str, approver: &str) -> Result<ControlGroupRequest, CoreError>;

    async fn status(&self, id: &str) -> Result<ControlGroupRequest, CoreError>;
}

/// Node without control group support.
///
/// A policy that asks for approval cannot be satisfied here, so such
/// requests are refused rather than run unapproved.
pub struct DisabledControlGroupGate;

#[async_trait]
impl ControlGroupGate for DisabledControlGroupGate {
    async fn check_needs_cg(
        &self,
        request: &Request,
        decision: PolicyDecision,
    ) -> Result<Outcome<GateOutcome>, CoreError> {
        if request.control_group.is_some() || request.control_group_token.is_some() {
            return Err(CoreError::InvalidRequest(
                "control groups are not enabled".to_string(),
            ));
        }
        match decision {
            PolicyDecision::ControlGroupRequired { .. } => Err(CoreError::ControlGroupDenied(
                "control groups are not enabled".to_string(),
            )),
            _ => Ok(Outcome::NotApplicable),
        }
    }

    async fn authorize(&self, _id: &str, _approver: &str) -> Result<ControlGroupRequest, CoreError> {
        Err(CoreError::UnsupportedPath("sys/control-group/authorize".to_string()))
    }

    async fn deny(&self, _id: &str, _approver: &str) -> Result<ControlGroupRequest, CoreError> {
        Err(CoreError::UnsupportedPath("sys/control-group/deny".to_string()))
    }

    async fn status(&self, _id: &str) -> Result<ControlGroupRequest, CoreError> {
        Err(CoreError::UnsupportedPath("sys/control-group/request".to_string()))
    }
}

/// Control groups persisted through storage; writes happen on the active node only.
pub struct PersistentControlGroupGate {
    ctx: NodeContext,
    opening: KeyedLocks<RequestFingerprint>,
    writing: KeyedLocks<String>,
}

impl PersistentControlGroupGate {
    pub fn new(ctx: NodeContext) -> Self {
        Self {
            ctx,
            opening: KeyedLocks::new(),
            writing: KeyedLocks::new(),
        }
    }

    fn require_active(&self) -> Result<(), CoreError> {
        if self.ctx.state.is_active() {
            Ok(())
        } else {
            Err(CoreError::NotActiveNode)
        }
    }

    async fn load(&self, id: &str) -> Result<ControlGroupRequest, CoreError> {
        get_json(self.ctx.storage.as_ref(), &control_group_storage_key(id))
            .await?
            .ok_or_else(|| CoreError::InvalidRequest(format!("unknown control group request {}", id)))
    }

    fn pending_response(cg: &ControlGroupRequest) -> Response {
        let mut response = Response {
            control_group: Some(ControlGroupPending {
                token: cg.id.clone(),
                status: cg.status(),
                created_at: cg.created_at,
                ttl_secs: cg.ttl_secs,
            }),
            ..Default::default()
        };
        response.add_warning(PENDING_WARNING);
        response
    }

    /// Park `request`, or return the marker already parked for the same request.
    async fn open(&self, request: &Request, approvals: u32) -> Result<Response, CoreError> {
        let fingerprint = request.fingerprint();
        let _guard = self.opening.lock(fingerprint.clone()).await;
        let storage = self.ctx.storage.as_ref();
        let index_key = control_group_fingerprint_key(&fingerprint);

        if let Some(existing_id) = get_json::<String>(storage, &index_key).await? {
            if let Some(existing) =
                get_json::<ControlGroupRequest>(storage, &control_group_storage_key(&existing_id))
                    .await?
            {
                let reusable = match existing.status() {
                    ControlGroupStatus::Pending => true,
                    ControlGroupStatus::Approved => existing.redeemed_at.is_none(),
                    _ => false,
                };
                if reusable {
                    tracing::debug!(control_group = %existing.id, "Request already parked");
                    return Ok(Self::pending_response(&existing));
                }
            }
        }

        let required = if approvals == 0 {
            self.ctx.config.control_group.required_approvals
        } else {
            approvals
        };

        // Tokens are not kept at rest; the replay runs on the approval instead
        let mut parked = request.clone();
        parked.client_token = None;
        parked.control_group_token = None;

        let cg = ControlGroupRequest::new(parked, required, self.ctx.config.control_group.ttl_seconds);
        storage
            .put_batch(vec![
                put_op(cg.storage_key(), &cg)?,
                put_op(index_key, &cg.id)?,
            ])
            .await?;

        metrics::counter!(crate::services::metrics::CONTROL_GROUP_PENDING_TOTAL).increment(1);
        tracing::info!(
            control_group = %cg.id,
            path = %cg.request.path,
            required_approvals = cg.required_approvals,
            "Request parked pending control group approval"
        );

        Ok(Self::pending_response(&cg))
    }

    /// Consume an approval. Succeeds exactly once per control group.
    async fn redeem(&self, id: &str, fingerprint: &RequestFingerprint) -> Result<(), CoreError> {
        let _guard = self.writing.lock(id.to_string()).await;
        let mut cg = self.load(id).await?;

        if &cg.fingerprint != fingerprint {
            return Err(CoreError::InvalidRequest(
                "control group marker does not match request".to_string(),
            ));
        }
        if cg.redeemed_at.is_some() {
            return Err(CoreError::ControlGroupExpired(format!("{} already redeemed", id)));
        }
        match cg.status() {
            ControlGroupStatus::Approved => {}
            ControlGroupStatus::Pending => {
                return Err(CoreError::InvalidRequest(format!("{} is not approved", id)))
            }
            ControlGroupStatus::Denied => return Err(CoreError::ControlGroupDenied(id.to_string())),
            ControlGroupStatus::Expired => {
                return Err(CoreError::ControlGroupExpired(id.to_string()))
            }
        }

        cg.redeemed_at = Some(Utc::now());
        put_json(self.ctx.storage.as_ref(), &cg.storage_key(), &cg).await?;
        tracing::info!(control_group = %id, "Control group approval redeemed");
        Ok(())
    }

    async fn release_by_token(
        &self,
        request: &Request,
        token: &str,
    ) -> Result<GateOutcome, CoreError> {
        let cg = self.load(token).await?;
        match cg.status() {
            ControlGroupStatus::Pending => Ok(GateOutcome::Respond(Self::pending_response(&cg))),
            ControlGroupStatus::Denied => Err(CoreError::ControlGroupDenied(cg.id)),
            ControlGroupStatus::Expired => Err(CoreError::ControlGroupExpired(cg.id)),
            ControlGroupStatus::Approved => {
                if cg.redeemed_at.is_some() {
                    return Err(CoreError::ControlGroupExpired(format!(
                        "{} already redeemed",
                        cg.id
                    )));
                }
                let marker = cg.marker();
                let mut released = cg.request;
                released.id = request.id.clone();
                released.control_group = Some(marker.clone());

                // A standby only attaches the marker; the active node redeems it
                if self.ctx.state.is_active() {
                    self.redeem(&marker.id, &marker.fingerprint).await?;
                }
                Ok(GateOutcome::Release(released))
            }
        }
    }

    async fn release_by_marker(
        &self,
        request: &Request,
        marker: &ControlGroupMarker,
    ) -> Result<GateOutcome, CoreError> {
        if request.fingerprint() != marker.fingerprint {
            return Err(CoreError::InvalidRequest(
                "control group marker does not match request".to_string(),
            ));
        }
        self.redeem(&marker.id, &marker.fingerprint).await?;
        Ok(GateOutcome::Release(request.clone()))
    }
}

#[async_trait]
impl ControlGroupGate for PersistentControlGroupGate {
    async fn check_needs_cg(
        &self,
        request: &Request,
        decision: PolicyDecision,
    ) -> Result<Outcome<GateOutcome>, CoreError> {
        if let Some(marker) = &request.control_group {
            if !self.ctx.state.is_active() {
                return Ok(Outcome::Applied(GateOutcome::Defer));
            }
            return self
                .release_by_marker(request, marker)
                .await
                .map(Outcome::Applied);
        }

        if let Some(token) = &request.control_group_token {
            return self
                .release_by_token(request, token)
                .await
                .map(Outcome::Applied);
        }

        match decision {
            PolicyDecision::ControlGroupRequired { approvals } => {
                if !self.ctx.state.is_active() {
                    return Ok(Outcome::Applied(GateOutcome::Defer));
                }
                self.open(request, approvals)
                    .await
                    .map(|resp| Outcome::Applied(GateOutcome::Respond(resp)))
            }
            _ => Ok(Outcome::NotApplicable),
        }
    }

    async fn authorize(&self, id: &str, approver: &str) -> Result<ControlGroupRequest, CoreError> {
        self.require_active()?;
        let _guard = self.writing.lock(id.to_string()).await;
        let mut cg = self.load(id).await?;

        match cg.status() {
            ControlGroupStatus::Denied => return Err(CoreError::ControlGroupDenied(cg.id)),
            ControlGroupStatus::Expired => return Err(CoreError::ControlGroupExpired(cg.id)),
            ControlGroupStatus::Approved => return Ok(cg),
            ControlGroupStatus::Pending => {}
        }
        if cg.has_approval_from(approver) {
            return Ok(cg);
        }

        cg.approvals.push(Approval {
            approver: approver.to_string(),
            approved_at: Utc::now(),
        });
        put_json(self.ctx.storage.as_ref(), &cg.storage_key(), &cg).await?;

        tracing::info!(
            control_group = %cg.id,
            approver = %approver,
            approvals = cg.approvals.len(),
            required = cg.required_approvals,
            "Control group approval recorded"
        );
        Ok(cg)
    }

    async fn deny(&self, id: &str, approver: &str) -> Result<ControlGroupRequest, CoreError> {
        self.require_active()?;
        let _guard = self.writing.lock(id.to_string()).await;
        let mut cg = self.load(id).await?;

        if cg.redeemed_at.is_some() {
            return Err(CoreError::InvalidRequest(format!("{} already redeemed", id)));
        }
        match cg.status() {
            ControlGroupStatus::Denied => return Ok(cg),
            ControlGroupStatus::Expired => return Err(CoreError::ControlGroupExpired(cg.id)),
            _ => {}
        }

        cg.denied_by = Some(approver.to_string());
        put_json(self.ctx.storage.as_ref(), &cg.storage_key(), &cg).await?;
        tracing::info!(control_group = %cg.id, approver = %approver, "Control group denied");
        Ok(cg)
    }

    async fn status(&self, id: &str) -> Result<ControlGroupRequest, CoreError> {
        self.load(id).await
    }
}
