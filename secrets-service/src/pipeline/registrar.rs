//! Lease and auth registration.
//!
//! Registration is owned by the expiration manager of the current active term.
//! A role change swaps or drops the manager, so callers fetch a register
//! function per request instead of holding one.

use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::lease::{hash_token, lease_storage_key, token_id_storage_key, token_storage_key};
use crate::models::{Auth, Lease, Request, SecretLease, TokenEntry};
use crate::services::storage::{get_json, put_json, put_op};
use crate::services::{BatchOp, CoreError, Storage};

/// Records a lease for (request, secret, source) and returns its id.
pub type LeaseRegisterFunc = Box<
    dyn Fn(&Request, &SecretLease, &str) -> BoxFuture<'static, Result<String, CoreError>>
        + Send
        + Sync,
>;

/// Records a successful login's token.
pub type AuthRegisterFunc =
    Box<dyn Fn(&Request, &Auth) -> BoxFuture<'static, Result<(), CoreError>> + Send + Sync>;

pub struct ExpirationManager {
    storage: Arc<dyn Storage>,
    term: u64,
}

impl ExpirationManager {
    pub fn new(storage: Arc<dyn Storage>, term: u64) -> Self {
        Self { storage, term }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub async fn register_lease(
        &self,
        request: &Request,
        secret: &SecretLease,
        source: &str,
    ) -> Result<String, CoreError> {
        let issued_at = chrono::Utc::now();
        let lease = Lease {
            id: format!("{}/{}", request.path, Uuid::new_v4()),
            path: request.path.clone(),
            source: source.to_string(),
            issued_at,
            expire_at: issued_at + chrono::Duration::seconds(secret.ttl_secs as i64),
            renewable: secret.renewable,
            internal_data: secret.internal_data.clone(),
        };
        put_json(self.storage.as_ref(), &lease.storage_key(), &lease).await?;
        tracing::debug!(lease_id = %lease.id, ttl_secs = secret.ttl_secs, "Lease registered");
        Ok(lease.id)
    }

    pub async fn register_auth(&self, request: &Request, auth: &Auth) -> Result<(), CoreError> {
        let token_hash = hash_token(&auth.client_token);
        let entry = TokenEntry {
            accessor: auth.accessor.clone(),
            token_hash: token_hash.clone(),
            path: request.path.clone(),
            display_name: auth.display_name.clone(),
            policies: auth.policies.clone(),
            metadata: auth.metadata.clone(),
            entity_id: auth.entity_id.clone(),
            issued_at: auth.issued_at,
            expire_at: auth.expires_at(),
            renewable: auth.renewable,
        };
        self.storage
            .put_batch(vec![
                put_op(entry.storage_key(), &entry)?,
                put_op(token_id_storage_key(&token_hash), &entry.accessor)?,
            ])
            .await?;
        tracing::debug!(accessor = %entry.accessor, "Auth registered");
        Ok(())
    }

    pub async fn revoke(&self, lease_id: &str) -> Result<(), CoreError> {
        self.storage.delete(&lease_storage_key(lease_id)).await?;
        tracing::info!(lease_id = %lease_id, "Lease revoked");
        Ok(())
    }

    pub async fn revoke_token(&self, accessor: &str) -> Result<(), CoreError> {
        let Some(entry) =
            get_json::<TokenEntry>(self.storage.as_ref(), &token_storage_key(accessor)).await?
        else {
            return Ok(());
        };
        self.storage
            .put_batch(vec![
                BatchOp::Delete(entry.storage_key()),
                BatchOp::Delete(token_id_storage_key(&entry.token_hash)),
            ])
            .await?;
        tracing::info!(accessor = %accessor, "Token revoked");
        Ok(())
    }
}

pub struct Registrars {
    storage: Arc<dyn Storage>,
    current: RwLock<Option<Arc<ExpirationManager>>>,
}

impl Registrars {
    pub fn new(storage: Arc<dyn Storage>, active: bool) -> Self {
        let current = active.then(|| Arc::new(ExpirationManager::new(storage.clone(), 1)));
        Self {
            storage,
            current: RwLock::new(current),
        }
    }

    /// Start a new term's manager; called when the node becomes active.
    pub async fn activate(&self) {
        let mut current = self.current.write().await;
        let term = current.as_ref().map(|m| m.term()).unwrap_or(0) + 1;
        *current = Some(Arc::new(ExpirationManager::new(self.storage.clone(), term)));
        tracing::info!(term, "Expiration manager started");
    }

    pub async fn deactivate(&self) {
        if self.current.write().await.take().is_some() {
            tracing::info!("Expiration manager stopped");
        }
    }

    pub async fn manager(&self) -> Result<Arc<ExpirationManager>, CoreError> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(CoreError::NotActiveNode)
    }

    pub async fn get_lease_register_func(&self) -> Result<LeaseRegisterFunc, CoreError> {
        let manager = self.manager().await?;
        Ok(Box::new(move |request: &Request, secret: &SecretLease, source: &str| {
            let manager = manager.clone();
            let request = request.clone();
            let secret = secret.clone();
            let source = source.to_string();
            async move { manager.register_lease(&request, &secret, &source).await }.boxed()
        }))
    }

    pub async fn get_auth_register_func(&self) -> Result<AuthRegisterFunc, CoreError> {
        let manager = self.manager().await?;
        Ok(Box::new(move |request: &Request, auth: &Auth| {
            let manager = manager.clone();
            let request = request.clone();
            let auth = auth.clone();
            async move { manager.register_auth(&request, &auth).await }.boxed()
        }))
    }

    /// Token entry for a client token; readable on any node.
    pub async fn lookup_token(&self, client_token: &str) -> Result<Option<TokenEntry>, CoreError> {
        let storage = self.storage.as_ref();
        let Some(accessor) =
            get_json::<String>(storage, &token_id_storage_key(&hash_token(client_token))).await?
        else {
            return Ok(None);
        };
        get_json(storage, &token_storage_key(&accessor)).await
    }
}
