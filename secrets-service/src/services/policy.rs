//! Policy evaluation seam.
//!
//! ACL parsing lives outside this crate; the pipeline only needs the verdict
//! for a request, including whether it must first pass a control group.

use async_trait::async_trait;

use crate::models::Request;
use crate::services::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    /// Allowed once `approvals` distinct approvers sign off.
    ControlGroupRequired { approvals: u32 },
    Denied,
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(
        &self,
        request: &Request,
        entity_id: Option<&str>,
    ) -> Result<PolicyDecision, CoreError>;
}

/// Path-prefix rules, first match wins; anything unmatched is allowed.
#[derive(Debug, Clone, Default)]
pub struct PathPolicyEngine {
    rules: Vec<(String, PolicyDecision)>,
}

impl PathPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, prefix: &str) -> Self {
        self.rules.push((prefix.to_string(), PolicyDecision::Denied));
        self
    }

    pub fn require_approvals(mut self, prefix: &str, approvals: u32) -> Self {
        self.rules.push((
            prefix.to_string(),
            PolicyDecision::ControlGroupRequired { approvals },
        ));
        self
    }
}

#[async_trait]
impl PolicyEngine for PathPolicyEngine {
    async fn evaluate(
        &self,
        request: &Request,
        _entity_id: Option<&str>,
    ) -> Result<PolicyDecision, CoreError> {
        Ok(self
            .rules
            .iter()
            .find(|(prefix, _)| request.path.starts_with(prefix.as_str()))
            .map(|(_, decision)| *decision)
            .unwrap_or(PolicyDecision::Allowed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Operation;

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let engine = PathPolicyEngine::new()
            .deny("secret/admin")
            .require_approvals("secret/", 2);

        let admin = Request::new(Operation::Read, "secret/admin/root");
        let payroll = Request::new(Operation::Read, "secret/payroll");
        let kv = Request::new(Operation::Read, "kv/app");

        assert_eq!(
            engine.evaluate(&admin, None).await.unwrap(),
            PolicyDecision::Denied
        );
        assert_eq!(
            engine.evaluate(&payroll, None).await.unwrap(),
            PolicyDecision::ControlGroupRequired { approvals: 2 }
        );
        assert_eq!(
            engine.evaluate(&kv, None).await.unwrap(),
            PolicyDecision::Allowed
        );
    }
}
