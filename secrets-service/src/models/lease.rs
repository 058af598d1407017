//! Lease and token records owned by the expiration manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    /// Path of the request that issued the secret.
    pub path: String,
    /// Mount or subsystem that produced the secret.
    pub source: String,
    pub issued_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub renewable: bool,
    #[serde(default)]
    pub internal_data: Map<String, Value>,
}

impl Lease {
    pub fn storage_key(&self) -> String {
        lease_storage_key(&self.id)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expire_at
    }
}

pub fn lease_storage_key(id: &str) -> String {
    format!("sys/expire/id/{}", id)
}

/// Registered login token, looked up by accessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub accessor: String,
    /// SHA-256 of the client token; the token itself is never stored.
    pub token_hash: String,
    pub path: String,
    pub display_name: String,
    pub policies: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub renewable: bool,
}

impl TokenEntry {
    pub fn storage_key(&self) -> String {
        token_storage_key(&self.accessor)
    }
}

pub fn token_storage_key(accessor: &str) -> String {
    format!("sys/token/accessor/{}", accessor)
}

/// Index from token hash to accessor.
pub fn token_id_storage_key(token_hash: &str) -> String {
    format!("sys/token/id/{}", token_hash)
}

pub fn hash_token(client_token: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(client_token.as_bytes()))
}
