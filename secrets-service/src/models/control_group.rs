//! Control group records - requests parked until enough approvers sign off.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Request, RequestFingerprint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlGroupStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

/// Marker attached to a request whose approval has been redeemed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlGroupMarker {
    pub id: String,
    pub fingerprint: RequestFingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub approver: String,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlGroupRequest {
    pub id: String,
    pub fingerprint: RequestFingerprint,
    /// The original request, replayed once approval is redeemed.
    pub request: Request,
    pub required_approvals: u32,
    #[serde(default)]
    pub approvals: Vec<Approval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeemed_at: Option<DateTime<Utc>>,
}

impl ControlGroupRequest {
    pub fn new(request: Request, required_approvals: u32, ttl_secs: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fingerprint: request.fingerprint(),
            request,
            required_approvals: required_approvals.max(1),
            approvals: Vec::new(),
            denied_by: None,
            created_at: Utc::now(),
            ttl_secs,
            redeemed_at: None,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> ControlGroupStatus {
        if self.denied_by.is_some() {
            ControlGroupStatus::Denied
        } else if self.redeemed_at.is_none() && now >= self.expires_at() {
            ControlGroupStatus::Expired
        } else if self.approvals.len() as u32 >= self.required_approvals {
            ControlGroupStatus::Approved
        } else {
            ControlGroupStatus::Pending
        }
    }

    pub fn status(&self) -> ControlGroupStatus {
        self.status_at(Utc::now())
    }

    pub fn has_approval_from(&self, approver: &str) -> bool {
        self.approvals.iter().any(|a| a.approver == approver)
    }

    pub fn marker(&self) -> ControlGroupMarker {
        ControlGroupMarker {
            id: self.id.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    pub fn storage_key(&self) -> String {
        control_group_storage_key(&self.id)
    }
}

pub fn control_group_storage_key(id: &str) -> String {
    format!("sys/control-group/request/{}", id)
}

/// Index from request fingerprint to its single pending control group.
pub fn control_group_fingerprint_key(fingerprint: &RequestFingerprint) -> String {
    format!("sys/control-group/fingerprint/{}", fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Operation;

    fn sample(required: u32, ttl: u64) -> ControlGroupRequest {
        ControlGroupRequest::new(Request::new(Operation::Read, "secret/payroll"), required, ttl)
    }

    #[test]
    fn test_status_transitions() {
        let mut cg = sample(2, 60);
        assert_eq!(cg.status(), ControlGroupStatus::Pending);

        cg.approvals.push(Approval {
            approver: "alice".to_string(),
            approved_at: Utc::now(),
        });
        assert_eq!(cg.status(), ControlGroupStatus::Pending);

        cg.approvals.push(Approval {
            approver: "bob".to_string(),
            approved_at: Utc::now(),
        });
        assert_eq!(cg.status(), ControlGroupStatus::Approved);

        cg.denied_by = Some("carol".to_string());
        assert_eq!(cg.status(), ControlGroupStatus::Denied);
    }

    #[test]
    fn test_expiry() {
        let cg = sample(1, 10);
        let later = cg.created_at + chrono::Duration::seconds(11);
        assert_eq!(cg.status_at(later), ControlGroupStatus::Expired);
    }
}
