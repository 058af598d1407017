//! Identity models - durable entities and the aliases that point at them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::AliasInfo;

/// Lookup key for an alias: one alias per (mount, external name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AliasKey {
    pub mount_accessor: String,
    pub name: String,
}

impl AliasKey {
    pub fn new(mount_accessor: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mount_accessor: mount_accessor.into(),
            name: name.into(),
        }
    }

    pub fn storage_key(&self) -> String {
        format!("identity/alias/{}/{}", self.mount_accessor, self.name)
    }
}

impl From<&AliasInfo> for AliasKey {
    fn from(info: &AliasInfo) -> Self {
        AliasKey::new(&info.mount_accessor, &info.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub id: String,
    pub entity_id: String,
    pub mount_accessor: String,
    pub mount_type: String,
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub local: bool,
    pub created_at: DateTime<Utc>,
}

impl Alias {
    pub fn new(entity_id: impl Into<String>, info: &AliasInfo) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            mount_accessor: info.mount_accessor.clone(),
            mount_type: info.mount_type.clone(),
            name: info.name.clone(),
            metadata: info.metadata.clone(),
            local: info.local,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> AliasKey {
        AliasKey::new(&self.mount_accessor, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<AliasKey>,
    #[serde(default)]
    pub merged_entity_ids: Vec<String>,
    #[serde(default)]
    pub policies: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            name: format!("entity_{}", &id[..8]),
            id,
            aliases: Vec::new(),
            merged_entity_ids: Vec::new(),
            policies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn storage_key(&self) -> String {
        entity_storage_key(&self.id)
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::new()
    }
}

pub fn entity_storage_key(id: &str) -> String {
    format!("identity/entity/{}", id)
}

/// Alias creation shipped to the node that is authoritative for identity writes.
///
/// Always yields a fresh entity; a peer cannot name an existing one to attach
/// the alias to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasCreation {
    pub alias: AliasInfo,
}
