//! MFA response cache.
//!
//! A login that already passed its second factor is remembered under the
//! request fingerprint, so a client retrying the identical login is not
//! prompted again until the entry expires.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{ForwardingClient, NodeState};
use crate::models::mfa::mfa_cache_key;
use crate::models::{Auth, MfaCachedAuthResponse, Request, RequestFingerprint};
use crate::services::{CacheStore, CoreError};

/// Second-factor check for a login that produced `auth`.
#[async_trait]
pub trait MfaValidator: Send + Sync {
    async fn validate(&self, request: &Request, auth: &Auth) -> Result<(), CoreError>;
}

pub struct MfaCache {
    cache: Arc<dyn CacheStore>,
    state: Arc<NodeState>,
    forwarder: Option<ForwardingClient>,
    ttl: Duration,
}

impl MfaCache {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        state: Arc<NodeState>,
        forwarder: Option<ForwardingClient>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            state,
            forwarder,
            ttl,
        }
    }

    /// Cached auth for `fingerprint`; expired entries read as a miss.
    pub async fn lookup(&self, fingerprint: &RequestFingerprint) -> Result<Option<Auth>, CoreError> {
        match self.cache.get_cache(&mfa_cache_key(fingerprint)).await? {
            Some(raw) => {
                let entry: MfaCachedAuthResponse = serde_json::from_str(&raw)?;
                Ok(Some(entry.auth))
            }
            None => Ok(None),
        }
    }

    pub async fn save_locally(&self, entry: &MfaCachedAuthResponse) -> Result<(), CoreError> {
        self.cache
            .set_cache(&entry.cache_key(), &serde_json::to_string(entry)?, self.ttl)
            .await?;
        tracing::debug!(fingerprint = %entry.fingerprint, "MFA result cached");
        Ok(())
    }

    /// Store on the active node, handing the entry over when this node is not it.
    pub async fn possibly_forward_save_cached_auth_response(
        &self,
        entry: &MfaCachedAuthResponse,
    ) -> Result<(), CoreError> {
        if self.state.is_active() {
            return self.save_locally(entry).await;
        }
        match &self.forwarder {
            Some(forwarder) => forwarder.forward_mfa_response(entry).await,
            None => Err(CoreError::ForwardingUnsupported(
                "cannot reach the active node to cache the MFA result".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterMode, NodeRole, ReplicationRole};
    use crate::models::Operation;
    use crate::services::MemoryCache;

    fn state(role: NodeRole) -> Arc<NodeState> {
        Arc::new(NodeState::new(
            "n1",
            ClusterMode::Clustered,
            ReplicationRole::Primary,
            role,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_until_ttl() {
        let mfa = MfaCache::new(
            Arc::new(MemoryCache::new()),
            state(NodeRole::Active),
            None,
            Duration::from_secs(30),
        );
        let request = Request::new(Operation::Update, "auth/userpass/login/alice");
        let fingerprint = request.fingerprint();
        let auth = Auth::new("tok-1", "alice");

        let entry = MfaCachedAuthResponse::new(fingerprint.clone(), auth.clone());
        mfa.possibly_forward_save_cached_auth_response(&entry)
            .await
            .unwrap();
        assert_eq!(mfa.lookup(&fingerprint).await.unwrap(), Some(auth));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(mfa.lookup(&fingerprint).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_standby_without_channel_cannot_save() {
        let mfa = MfaCache::new(
            Arc::new(MemoryCache::new()),
            state(NodeRole::Standby),
            None,
            Duration::from_secs(30),
        );
        let entry = MfaCachedAuthResponse::new(
            RequestFingerprint("abc".to_string()),
            Auth::new("tok", "bob"),
        );
        let err = mfa
            .possibly_forward_save_cached_auth_response(&entry)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ForwardingUnsupported(_)));
    }
}
