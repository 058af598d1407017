use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::services::CoreError;

/// Time-bounded node cache backing the lockout tracker and MFA cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn set_cache(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoreError>;
    /// Expired entries read as absent.
    async fn get_cache(&self, key: &str) -> Result<Option<String>, CoreError>;
    async fn delete_cache(&self, key: &str) -> Result<(), CoreError>;
    async fn health_check(&self) -> Result<(), CoreError>;
}

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(url: &str) -> Result<Self, CoreError> {
        tracing::info!(url = %url, "Connecting to Redis");
        let client = Client::open(url)?;

        // ConnectionManager reconnects on its own
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            CoreError::Storage(format!("Failed to connect to Redis: {}", e))
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl CacheStore for RedisService {
    async fn health_check(&self) -> Result<(), CoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Storage(format!("Redis health check failed: {}", e)))
    }

    async fn set_cache(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Storage(format!("Failed to set cache: {}", e)))
    }

    async fn get_cache(&self, key: &str) -> Result<Option<String>, CoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Storage(format!("Failed to get cache: {}", e)))
    }

    async fn delete_cache(&self, key: &str) -> Result<(), CoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Storage(format!("Failed to delete cache: {}", e)))
    }
}

/// In-process cache used when no Redis URL is configured.
///
/// Expiry uses tokio's clock so paused-time tests can step over TTLs.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries; lookups already ignore them.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Purge expired entries every `every` until `cancel` fires. Keys that are
    /// never read again (one per failed-login user, one per MFA fingerprint)
    /// would otherwise stay forever.
    pub fn spawn_purger(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let before = cache.len();
                        cache.purge_expired();
                        let purged = before.saturating_sub(cache.len());
                        if purged > 0 {
                            tracing::debug!(purged, "Expired cache entries purged");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn health_check(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn set_cache(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoreError> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get_cache(&self, key: &str) -> Result<Option<String>, CoreError> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        Ok(hit)
    }

    async fn delete_cache(&self, key: &str) -> Result<(), CoreError> {
        self.entries.remove(key);
        Ok(())
    }
}
