//! Failed login bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity a failed login is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailedLoginUser {
    pub mount: String,
    pub alias_name: String,
}

impl FailedLoginUser {
    pub fn new(mount: impl Into<String>, alias_name: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
            alias_name: alias_name.into(),
        }
    }

    pub fn cache_key(&self) -> String {
        format!("lockout:{}:{}", self.mount, self.alias_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedLoginInfo {
    pub count: u32,
    pub last_failed_at: DateTime<Utc>,
}

impl FailedLoginInfo {
    pub fn first_failure() -> Self {
        Self {
            count: 1,
            last_failed_at: Utc::now(),
        }
    }

    pub fn incremented(&self) -> Self {
        Self {
            count: self.count.saturating_add(1),
            last_failed_at: Utc::now(),
        }
    }
}
