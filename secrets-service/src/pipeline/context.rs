use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{ClusterMode, NodeRole, ReplicationRole, SecretsConfig};
use crate::services::{CacheStore, CoreError, Storage};

/// Role of this node, observable by anything that must react to a failover.
pub struct NodeState {
    node_id: String,
    mode: ClusterMode,
    replication_role: ReplicationRole,
    role: watch::Sender<NodeRole>,
}

impl NodeState {
    pub fn new(
        node_id: impl Into<String>,
        mode: ClusterMode,
        replication_role: ReplicationRole,
        initial: NodeRole,
    ) -> Self {
        let (role, _) = watch::channel(initial);
        Self {
            node_id: node_id.into(),
            mode,
            replication_role,
            role,
        }
    }

    pub fn from_config(config: &SecretsConfig) -> Self {
        Self::new(
            config.cluster.node_id.clone(),
            config.cluster.mode,
            config.cluster.replication_role,
            config.cluster.node_role,
        )
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn mode(&self) -> ClusterMode {
        self.mode
    }

    pub fn role(&self) -> NodeRole {
        *self.role.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.role() == NodeRole::Active
    }

    pub fn is_performance_secondary(&self) -> bool {
        self.replication_role == ReplicationRole::PerformanceSecondary
    }

    /// Only the active node of the primary cluster writes replicated identity records.
    pub fn is_identity_authoritative(&self) -> bool {
        self.is_active() && !self.is_performance_secondary()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeRole> {
        self.role.subscribe()
    }

    /// Returns true when the role actually changed.
    pub fn promote(&self) -> bool {
        self.set_role(NodeRole::Active)
    }

    pub fn demote(&self) -> Result<bool, CoreError> {
        if self.mode == ClusterMode::Standalone {
            return Err(CoreError::InvalidRequest(
                "a standalone node cannot step down".to_string(),
            ));
        }
        Ok(self.set_role(NodeRole::Standby))
    }

    fn set_role(&self, next: NodeRole) -> bool {
        let previous = self.role.send_replace(next);
        if previous != next {
            tracing::info!(node_id = %self.node_id, from = ?previous, to = ?next, "Node role changed");
        }
        previous != next
    }
}

/// Everything a pipeline component may need from the node it runs on.
#[derive(Clone)]
pub struct NodeContext {
    pub config: Arc<SecretsConfig>,
    pub state: Arc<NodeState>,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<dyn CacheStore>,
}

impl NodeContext {
    pub fn new(
        config: SecretsConfig,
        storage: Arc<dyn Storage>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        let state = Arc::new(NodeState::from_config(&config));
        Self {
            config: Arc::new(config),
            state,
            storage,
            cache,
        }
    }
}
