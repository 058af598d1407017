//! Auth model - the result of a successful login.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Alias information produced by an auth method for the identity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasInfo {
    pub mount_accessor: String,
    pub mount_type: String,
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Alias lives on a node-local mount and is never replicated.
    #[serde(default)]
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub client_token: String,
    pub accessor: String,
    pub display_name: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<AliasInfo>,
    pub ttl_secs: u64,
    #[serde(default)]
    pub renewable: bool,
    /// The login must pass a second factor before the token is handed out.
    #[serde(default)]
    pub mfa_required: bool,
    pub issued_at: DateTime<Utc>,
}

impl Auth {
    pub fn new(client_token: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            client_token: client_token.into(),
            accessor: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            policies: Vec::new(),
            metadata: HashMap::new(),
            entity_id: None,
            alias: None,
            ttl_secs: 3600,
            renewable: true,
            mfa_required: false,
            issued_at: Utc::now(),
        }
    }

    pub fn with_policies(mut self, policies: &[&str]) -> Self {
        self.policies = policies.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_alias(mut self, alias: AliasInfo) -> Self {
        self.alias = Some(alias);
        self
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

impl AliasInfo {
    pub fn new(
        mount_accessor: impl Into<String>,
        mount_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            mount_accessor: mount_accessor.into(),
            mount_type: mount_type.into(),
            name: name.into(),
            metadata: HashMap::new(),
            local: false,
        }
    }
}
