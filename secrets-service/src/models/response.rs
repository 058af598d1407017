//! Response model returned through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Auth, ControlGroupStatus};

/// Secret material that must be tracked by a lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretLease {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    pub ttl_secs: u64,
    #[serde(default)]
    pub renewable: bool,
    /// Engine-private data needed to revoke the secret later.
    #[serde(default)]
    pub internal_data: Map<String, Value>,
}

/// Returned in place of the real result while a control group is pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlGroupPending {
    pub token: String,
    pub status: ControlGroupStatus,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretLease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_group: Option<ControlGroupPending>,
}

impl Response {
    pub fn with_data(data: Map<String, Value>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_auth(auth: Auth) -> Self {
        Self {
            auth: Some(auth),
            ..Default::default()
        }
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn is_control_group_pending(&self) -> bool {
        self.control_group.is_some()
    }
}
