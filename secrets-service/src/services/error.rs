use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::retry::Retryable;
use thiserror::Error;

/// Every way a request can fail inside the pipeline.
///
/// Errors travel between nodes as data, so a forwarded request reports the
/// active node's error to the client as the very same variant.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CoreError {
    #[error("replication state not current: {0}")]
    ReplicationNotCurrent(String),

    #[error("request forwarding unsupported: {0}")]
    ForwardingUnsupported(String),

    #[error("request forwarding failed: {0}")]
    ForwardingFailed(String),

    #[error("node is not the active node")]
    NotActiveNode,

    /// The write belongs to the primary cluster; this node only serves reads.
    #[error("cannot write to a read-only node: {0}")]
    ReadOnly(String),

    #[error("control group request denied: {0}")]
    ControlGroupDenied(String),

    #[error("control group request expired: {0}")]
    ControlGroupExpired(String),

    #[error("too many failed login attempts; locked out for {retry_after_secs}s")]
    LockedOut { retry_after_secs: u64 },

    #[error("{0}")]
    IdentityCreationUnimplemented(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported path: {0}")]
    UnsupportedPath(String),

    #[error("mfa validation failed: {0}")]
    MfaValidationFailed(String),

    #[error("request canceled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Message used when a node has no way to hand identity writes to the authoritative node.
pub const ERR_CREATE_ENTITY_UNIMPLEMENTED: &str = "create entity unimplemented in the server";

impl CoreError {
    /// Same request, later time, may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ReplicationNotCurrent(_)
                | CoreError::ForwardingFailed(_)
                | CoreError::NotActiveNode
                | CoreError::Storage(_)
        )
    }

    /// Must never be retried automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoreError::ControlGroupDenied(_)
                | CoreError::ControlGroupExpired(_)
                | CoreError::LockedOut { .. }
                | CoreError::IdentityCreationUnimplemented(_)
                | CoreError::ForwardingUnsupported(_)
                | CoreError::RegistrationFailed(_)
                | CoreError::PermissionDenied
        )
    }

    /// Short label for logs and metrics.
    pub fn class(&self) -> &'static str {
        match self {
            CoreError::ReplicationNotCurrent(_) => "replication_not_current",
            CoreError::ForwardingUnsupported(_) => "forwarding_unsupported",
            CoreError::ForwardingFailed(_) => "forwarding_failed",
            CoreError::NotActiveNode => "not_active_node",
            CoreError::ReadOnly(_) => "read_only",
            CoreError::ControlGroupDenied(_) => "control_group_denied",
            CoreError::ControlGroupExpired(_) => "control_group_expired",
            CoreError::LockedOut { .. } => "locked_out",
            CoreError::IdentityCreationUnimplemented(_) => "identity_creation_unimplemented",
            CoreError::RegistrationFailed(_) => "registration_failed",
            CoreError::PermissionDenied => "permission_denied",
            CoreError::InvalidCredentials => "invalid_credentials",
            CoreError::InvalidRequest(_) => "invalid_request",
            CoreError::UnsupportedPath(_) => "unsupported_path",
            CoreError::MfaValidationFailed(_) => "mfa_validation_failed",
            CoreError::Cancelled => "cancelled",
            CoreError::Storage(_) => "storage",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl Retryable for CoreError {
    fn is_retryable(&self) -> bool {
        CoreError::is_retryable(self)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization error: {}", err))
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Internal(err.to_string())
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ReplicationNotCurrent(msg) => AppError::PreconditionFailed(
                format!("replication state not current: {}", msg),
                Some(1),
            ),
            CoreError::ForwardingUnsupported(msg) => {
                AppError::ConfigError(anyhow::anyhow!("request forwarding unsupported: {}", msg))
            }
            CoreError::ForwardingFailed(msg) => AppError::BadGateway(msg),
            CoreError::NotActiveNode => {
                AppError::ServiceUnavailable("node is not the active node".to_string())
            }
            e @ CoreError::ReadOnly(_) => AppError::ServiceUnavailable(e.to_string()),
            e @ (CoreError::ControlGroupDenied(_)
            | CoreError::ControlGroupExpired(_)
            | CoreError::PermissionDenied
            | CoreError::MfaValidationFailed(_)) => AppError::Forbidden(anyhow::anyhow!(e)),
            e @ CoreError::LockedOut { retry_after_secs } => {
                AppError::TooManyRequests(e.to_string(), Some(retry_after_secs))
            }
            CoreError::IdentityCreationUnimplemented(msg) => {
                AppError::ConfigError(anyhow::anyhow!(msg))
            }
            CoreError::InvalidCredentials => {
                AppError::Unauthorized(anyhow::anyhow!("invalid credentials"))
            }
            e @ (CoreError::InvalidRequest(_) | CoreError::Cancelled) => {
                AppError::BadRequest(anyhow::anyhow!(e))
            }
            CoreError::UnsupportedPath(path) => {
                AppError::NotFound(anyhow::anyhow!("unsupported path: {}", path))
            }
            e @ (CoreError::RegistrationFailed(_)
            | CoreError::Storage(_)
            | CoreError::Internal(_)) => AppError::InternalError(anyhow::anyhow!(e)),
        }
    }
}
