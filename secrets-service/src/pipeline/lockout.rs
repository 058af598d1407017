//! Failed-login lockout.
//!
//! Counters live in the node cache, keyed by (mount, alias name). Updates for
//! one user are serialized so concurrent failures never lose an increment.

use chrono::Utc;
use std::sync::Arc;

use crate::config::LockoutConfig;
use crate::models::{FailedLoginInfo, FailedLoginUser};
use crate::services::{CacheStore, CoreError, KeyedLocks};

pub struct LockoutTracker {
    cache: Arc<dyn CacheStore>,
    config: LockoutConfig,
    locks: KeyedLocks<FailedLoginUser>,
}

impl LockoutTracker {
    pub fn new(cache: Arc<dyn CacheStore>, config: LockoutConfig) -> Self {
        Self {
            cache,
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn get_user_failed_login_info(
        &self,
        user: &FailedLoginUser,
    ) -> Result<Option<FailedLoginInfo>, CoreError> {
        match self.cache.get_cache(&user.cache_key()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write the counters for `user`; `None` clears them.
    pub async fn update_user_failed_login_info(
        &self,
        user: &FailedLoginUser,
        info: Option<&FailedLoginInfo>,
    ) -> Result<(), CoreError> {
        let key = user.cache_key();
        match info {
            Some(info) => {
                let ttl = self.config.duration().max(self.config.counter_reset());
                self.cache
                    .set_cache(&key, &serde_json::to_string(info)?, ttl)
                    .await
            }
            None => self.cache.delete_cache(&key).await,
        }
    }

    /// Fails with `LockedOut` while `user` is over the threshold.
    pub async fn check_locked_out(&self, user: &FailedLoginUser) -> Result<(), CoreError> {
        if self.config.disabled {
            return Ok(());
        }
        let Some(info) = self.get_user_failed_login_info(user).await? else {
            return Ok(());
        };
        match self.remaining_lockout_secs(&info) {
            Some(retry_after_secs) => {
                metrics::counter!(crate::services::metrics::LOCKOUT_REJECTIONS_TOTAL).increment(1);
                tracing::warn!(
                    mount = %user.mount,
                    user = %user.alias_name,
                    failures = info.count,
                    retry_after_secs,
                    "Login rejected, user locked out"
                );
                Err(CoreError::LockedOut { retry_after_secs })
            }
            None => Ok(()),
        }
    }

    pub async fn record_failed_login(
        &self,
        user: &FailedLoginUser,
    ) -> Result<FailedLoginInfo, CoreError> {
        let _guard = self.locks.lock(user.clone()).await;
        let next = match self.get_user_failed_login_info(user).await? {
            Some(info) if !self.is_stale(&info) => info.incremented(),
            _ => FailedLoginInfo::first_failure(),
        };
        self.update_user_failed_login_info(user, Some(&next)).await?;

        if next.count == self.config.threshold && !self.config.disabled {
            tracing::warn!(
                mount = %user.mount,
                user = %user.alias_name,
                lockout_secs = self.config.duration_seconds,
                "User locked out after repeated failed logins"
            );
        }
        Ok(next)
    }

    pub async fn record_successful_login(&self, user: &FailedLoginUser) -> Result<(), CoreError> {
        let _guard = self.locks.lock(user.clone()).await;
        self.update_user_failed_login_info(user, None).await
    }

    fn elapsed_secs(info: &FailedLoginInfo) -> u64 {
        (Utc::now() - info.last_failed_at).num_seconds().max(0) as u64
    }

    fn remaining_lockout_secs(&self, info: &FailedLoginInfo) -> Option<u64> {
        if info.count < self.config.threshold {
            return None;
        }
        let elapsed = Self::elapsed_secs(info);
        (elapsed < self.config.duration_seconds).then(|| self.config.duration_seconds - elapsed)
    }

    /// Counters restart once the lockout has passed, or after a quiet period below the threshold.
    fn is_stale(&self, info: &FailedLoginInfo) -> bool {
        let elapsed = Self::elapsed_secs(info);
        if info.count >= self.config.threshold {
            elapsed >= self.config.duration_seconds
        } else {
            elapsed >= self.config.counter_reset_seconds
        }
    }
}
