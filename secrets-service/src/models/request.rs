//! Request model - an already-decoded client operation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{ControlGroupMarker, FailedLoginUser, RequestFingerprint};

/// Logical operation requested on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    List,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::List => "list",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Update | Operation::Delete
        )
    }
}

/// Connection the request arrived on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub remote_addr: Option<String>,
}

/// A point in the replicated write stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicationState {
    pub index: u64,
}

impl ReplicationState {
    pub fn new(index: u64) -> Self {
        Self { index }
    }

    pub fn includes(&self, required: &ReplicationState) -> bool {
        self.index >= required.index
    }
}

/// Paths a node answers itself regardless of its role.
const LOCAL_ONLY_PATHS: &[&str] = &["sys/health", "sys/leader", "sys/seal-status"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub operation: Operation,
    pub path: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub connection: ConnectionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    /// Minimum replicated state the caller has observed; the barrier waits for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_state: Option<ReplicationState>,
    /// Token returned to the client when the request was parked behind a control group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_group_token: Option<String>,
    /// Set only by the control group gate once an approval has been redeemed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_group: Option<ControlGroupMarker>,
}

impl Request {
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            path: path.into().trim_start_matches('/').to_string(),
            data: Map::new(),
            connection: ConnectionInfo::default(),
            client_token: None,
            required_state: None,
            control_group_token: None,
            control_group: None,
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_client_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = Some(token.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.connection.remote_addr = Some(addr.into());
        self
    }

    pub fn with_required_state(mut self, state: ReplicationState) -> Self {
        self.required_state = Some(state);
        self
    }

    pub fn with_control_group_token(mut self, token: impl Into<String>) -> Self {
        self.control_group_token = Some(token.into());
        self
    }

    /// Health and node-status paths never leave the node.
    pub fn is_local_only(&self) -> bool {
        LOCAL_ONLY_PATHS
            .iter()
            .any(|p| self.path == *p || self.path.starts_with(&format!("{}/", p)))
    }

    /// Mount segment of an `auth/<mount>/login[/<name>]` path.
    pub fn login_mount(&self) -> Option<&str> {
        let mut segments = self.path.split('/');
        match (segments.next(), segments.next(), segments.next()) {
            (Some("auth"), Some(mount), Some("login")) if !mount.is_empty() => Some(mount),
            _ => None,
        }
    }

    pub fn is_login(&self) -> bool {
        self.login_mount().is_some() && self.operation.is_write()
    }

    /// The (mount, user) pair a login attempt is counted against.
    ///
    /// The user comes from the trailing path segment, falling back to the
    /// `username` or `role_id` parameter.
    pub fn login_user(&self) -> Option<FailedLoginUser> {
        if !self.is_login() {
            return None;
        }
        let mount = self.login_mount()?;
        let prefix = format!("auth/{}/login/", mount);
        let from_path = self
            .path
            .strip_prefix(&prefix)
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string());
        let name = from_path.or_else(|| {
            ["username", "role_id"]
                .iter()
                .find_map(|key| self.data.get(*key).and_then(Value::as_str))
                .map(|s| s.to_string())
        })?;
        Some(FailedLoginUser::new(mount, name))
    }

    /// Stable digest of what the request asks for, independent of its id and tokens.
    pub fn fingerprint(&self) -> RequestFingerprint {
        let params: BTreeMap<&String, &Value> = self.data.iter().collect();
        let mut hasher = Sha256::new();
        hasher.update(self.operation.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.path.as_bytes());
        hasher.update([0u8]);
        // BTreeMap serialization is ordered, so equal parameters hash equally
        hasher.update(serde_json::to_vec(&params).unwrap_or_default());
        hasher.update([0u8]);
        if let Some(addr) = &self.connection.remote_addr {
            hasher.update(addr.as_bytes());
        }
        RequestFingerprint(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_only_paths() {
        assert!(Request::new(Operation::Read, "sys/health").is_local_only());
        assert!(Request::new(Operation::Read, "/sys/leader").is_local_only());
        assert!(!Request::new(Operation::Read, "sys/healthy").is_local_only());
        assert!(!Request::new(Operation::Update, "kv/app").is_local_only());
    }

    #[test]
    fn test_login_user_from_path() {
        let req = Request::new(Operation::Update, "auth/userpass/login/alice");
        let user = req.login_user().unwrap();
        assert_eq!(user.mount, "userpass");
        assert_eq!(user.alias_name, "alice");
    }

    #[test]
    fn test_login_user_from_parameters() {
        let req = Request::new(Operation::Update, "auth/approle/login").with_field("role_id", "r-1");
        let user = req.login_user().unwrap();
        assert_eq!(user.mount, "approle");
        assert_eq!(user.alias_name, "r-1");

        let read = Request::new(Operation::Read, "auth/approle/login").with_field("role_id", "r-1");
        assert!(read.login_user().is_none());
    }

    #[test]
    fn test_fingerprint_ignores_request_id_and_field_order() {
        let a = Request::new(Operation::Update, "auth/userpass/login/bob")
            .with_field("password", "pw")
            .with_field("nonce", 1);
        let b = Request::new(Operation::Update, "auth/userpass/login/bob")
            .with_field("nonce", 1)
            .with_field("password", "pw");
        assert_ne!(a.id, b.id);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = b.clone().with_remote_addr("10.0.0.9:5000");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
