//! Replication barrier.
//!
//! A client that wrote through one node and reads through another sends the
//! replication index it has observed; the barrier holds the request until the
//! local node has applied at least that index.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::Outcome;
use crate::models::{ReplicationState, Request};
use crate::services::CoreError;

/// The replication subsystem as seen from the request path.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Fails with `ReplicationNotCurrent` while the node is sealed.
    fn current_state(&self) -> Result<ReplicationState, CoreError>;

    /// Resolves once `target` has been applied locally, or fails if it never will be.
    async fn wait_for_state(&self, target: ReplicationState) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ReplicationFeed {
    applied: ReplicationState,
    sealed: bool,
}

/// Replication progress pushed in by the replication transport.
pub struct WatchReplicationSource {
    feed: watch::Sender<ReplicationFeed>,
}

impl WatchReplicationSource {
    pub fn new(initial: ReplicationState) -> Self {
        let (feed, _) = watch::channel(ReplicationFeed {
            applied: initial,
            sealed: false,
        });
        Self { feed }
    }

    /// Record that writes up to `index` are applied. Never moves backwards.
    pub fn advance(&self, index: u64) {
        self.feed.send_if_modified(|feed| {
            if index > feed.applied.index {
                feed.applied = ReplicationState::new(index);
                true
            } else {
                false
            }
        });
    }

    pub fn seal(&self) {
        self.feed.send_modify(|feed| feed.sealed = true);
    }

    pub fn unseal(&self) {
        self.feed.send_modify(|feed| feed.sealed = false);
    }
}

#[async_trait]
impl ReplicationSource for WatchReplicationSource {
    fn current_state(&self) -> Result<ReplicationState, CoreError> {
        let feed = *self.feed.borrow();
        if feed.sealed {
            return Err(CoreError::ReplicationNotCurrent("node is sealed".to_string()));
        }
        Ok(feed.applied)
    }

    async fn wait_for_state(&self, target: ReplicationState) -> Result<(), CoreError> {
        let mut rx = self.feed.subscribe();
        loop {
            let feed = *rx.borrow_and_update();
            if feed.sealed {
                return Err(CoreError::ReplicationNotCurrent("node is sealed".to_string()));
            }
            if feed.applied.includes(&target) {
                return Ok(());
            }
            rx.changed().await.map_err(|_| {
                CoreError::ReplicationNotCurrent("replication stream closed".to_string())
            })?;
        }
    }
}

#[async_trait]
pub trait ReplicationBarrier: Send + Sync {
    /// Either nothing to wait for, or the state the node reached after waiting.
    async fn wait_for_replication_state(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Outcome<ReplicationState>, CoreError>;

    fn sealed(&self) -> bool {
        false
    }
}

/// A single node applies its own writes; there is never anything to wait for.
pub struct StandaloneBarrier;

#[async_trait]
impl ReplicationBarrier for StandaloneBarrier {
    async fn wait_for_replication_state(
        &self,
        _request: &Request,
        _cancel: &CancellationToken,
    ) -> Result<Outcome<ReplicationState>, CoreError> {
        Ok(Outcome::NotApplicable)
    }
}

pub struct ClusterBarrier<S: ReplicationSource> {
    source: S,
    timeout: Duration,
}

impl<S: ReplicationSource> ClusterBarrier<S> {
    pub fn new(source: S, timeout: Duration) -> Self {
        Self { source, timeout }
    }
}

#[async_trait]
impl<S: ReplicationSource> ReplicationBarrier for ClusterBarrier<S> {
    async fn wait_for_replication_state(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Outcome<ReplicationState>, CoreError> {
        let Some(target) = request.required_state else {
            return Ok(Outcome::NotApplicable);
        };

        let current = self.source.current_state()?;
        if current.includes(&target) {
            return Ok(Outcome::Applied(current));
        }

        tracing::debug!(
            current = current.index,
            required = target.index,
            "Waiting for replication to catch up"
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => Err(CoreError::ReplicationNotCurrent(format!(
                "index {} not applied within {}ms",
                target.index,
                self.timeout.as_millis()
            ))),
            waited = self.source.wait_for_state(target) => {
                waited?;
                Ok(Outcome::Applied(self.source.current_state()?))
            }
        }
    }

    fn sealed(&self) -> bool {
        self.source.current_state().is_err()
    }
}

#[async_trait]
impl<T: ReplicationSource + ?Sized> ReplicationSource for std::sync::Arc<T> {
    fn current_state(&self) -> Result<ReplicationState, CoreError> {
        (**self).current_state()
    }

    async fn wait_for_state(&self, target: ReplicationState) -> Result<(), CoreError> {
        (**self).wait_for_state(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Operation;
    use std::sync::Arc;

    fn request_at(index: u64) -> Request {
        Request::new(Operation::Read, "kv/app").with_required_state(ReplicationState::new(index))
    }

    #[tokio::test]
    async fn test_no_required_state_needs_no_barrier() {
        let barrier = ClusterBarrier::new(
            WatchReplicationSource::new(ReplicationState::new(1)),
            Duration::from_millis(10),
        );
        let outcome = barrier
            .wait_for_replication_state(&Request::new(Operation::Read, "kv/a"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NotApplicable);
    }

    #[tokio::test]
    async fn test_waits_until_index_applied() {
        let source = Arc::new(WatchReplicationSource::new(ReplicationState::new(3)));
        let barrier = ClusterBarrier::new(source.clone(), Duration::from_secs(5));

        let feeder = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            feeder.advance(5);
            feeder.advance(9);
        });

        let outcome = barrier
            .wait_for_replication_state(&request_at(8), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Applied(state) if state.index >= 8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let barrier = ClusterBarrier::new(
            WatchReplicationSource::new(ReplicationState::new(1)),
            Duration::from_millis(100),
        );
        let err = barrier
            .wait_for_replication_state(&request_at(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ReplicationNotCurrent(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_sealed_node_fails_fast() {
        let source = WatchReplicationSource::new(ReplicationState::new(1));
        source.seal();
        let barrier = ClusterBarrier::new(source, Duration::from_secs(60));
        let err = barrier
            .wait_for_replication_state(&request_at(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ReplicationNotCurrent(_)));
        assert!(barrier.sealed());
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait() {
        let barrier = ClusterBarrier::new(
            WatchReplicationSource::new(ReplicationState::new(1)),
            Duration::from_secs(60),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = barrier
            .wait_for_replication_state(&request_at(100), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Cancelled);
    }
}
