//! Logical backends: the engines that actually serve a request once the
//! pipeline has decided it runs on this node.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::models::{Operation, Request, Response, SecretLease};
use crate::services::storage::{get_json, put_json, Storage};
use crate::services::CoreError;

#[async_trait]
pub trait LogicalBackend: Send + Sync {
    async fn execute(&self, request: &Request) -> Result<Response, CoreError>;

    /// Tear down secret material the engine issued for `request`.
    async fn revoke(&self, _request: &Request, _secret: &SecretLease) -> Result<(), CoreError> {
        Ok(())
    }
}

const KV_PREFIX: &str = "kv/";

/// Plain key/value engine mounted at `kv/`.
pub struct KvBackend {
    storage: Arc<dyn Storage>,
}

impl KvBackend {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn storage_key(path: &str) -> String {
        format!("logical/{}", path)
    }
}

#[async_trait]
impl LogicalBackend for KvBackend {
    async fn execute(&self, request: &Request) -> Result<Response, CoreError> {
        if !request.path.starts_with(KV_PREFIX) {
            return Err(CoreError::UnsupportedPath(request.path.clone()));
        }
        let key = Self::storage_key(&request.path);

        match request.operation {
            Operation::Read => {
                let data: Option<Map<String, Value>> =
                    get_json(self.storage.as_ref(), &key).await?;
                data.map(Response::with_data)
                    .ok_or_else(|| CoreError::UnsupportedPath(request.path.clone()))
            }
            Operation::Create | Operation::Update => {
                if request.data.is_empty() {
                    return Err(CoreError::InvalidRequest(
                        "no data provided to write".to_string(),
                    ));
                }
                put_json(self.storage.as_ref(), &key, &request.data).await?;
                Ok(Response::default())
            }
            Operation::Delete => {
                self.storage.delete(&key).await?;
                Ok(Response::default())
            }
            Operation::List => {
                let prefix = format!("{}/", key.trim_end_matches('/'));
                let keys: Vec<Value> = self
                    .storage
                    .list(&prefix)
                    .await?
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&prefix).map(|s| s.to_string()))
                    .map(Value::String)
                    .collect();
                let mut data = Map::new();
                data.insert("keys".to_string(), Value::Array(keys));
                Ok(Response::with_data(data))
            }
        }
    }
}
