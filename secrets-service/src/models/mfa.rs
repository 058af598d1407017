//! MFA cache entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Auth;

/// Hex SHA-256 digest identifying "the same request" across retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(pub String);

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Auth that already passed MFA validation for a given request fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MfaCachedAuthResponse {
    pub fingerprint: RequestFingerprint,
    pub auth: Auth,
    pub validated_at: DateTime<Utc>,
}

impl MfaCachedAuthResponse {
    pub fn new(fingerprint: RequestFingerprint, auth: Auth) -> Self {
        Self {
            fingerprint,
            auth,
            validated_at: Utc::now(),
        }
    }

    pub fn cache_key(&self) -> String {
        mfa_cache_key(&self.fingerprint)
    }
}

pub fn mfa_cache_key(fingerprint: &RequestFingerprint) -> String {
    format!("mfa:{}", fingerprint)
}
