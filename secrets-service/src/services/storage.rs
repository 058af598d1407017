//! Durable key/value storage seen through the barrier.
//!
//! The encrypting barrier and its physical backend live outside this crate;
//! the pipeline only needs opaque get/put plus an atomic multi-key write for
//! identity records.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::services::CoreError;

/// One write in an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
    /// Keys under `prefix`, returned in full.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError>;
    /// Apply every operation or none.
    async fn put_batch(&self, ops: Vec<BatchOp>) -> Result<(), CoreError>;
}

/// Typed JSON helpers over any [`Storage`].
pub async fn get_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, CoreError> {
    match storage.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize + Sync>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), CoreError> {
    storage.put(key, serde_json::to_vec(value)?).await
}

pub fn put_op<T: Serialize>(key: impl Into<String>, value: &T) -> Result<BatchOp, CoreError> {
    Ok(BatchOp::Put(key.into(), serde_json::to_vec(value)?))
}

/// Process-local storage used by single-node deployments and tests.
#[derive(Default)]
pub struct InMemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn put_batch(&self, ops: Vec<BatchOp>) -> Result<(), CoreError> {
        let mut entries = self.entries.write().await;
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
