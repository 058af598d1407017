//! Services layer for secrets-service.
//!
//! Storage and cache adapters, collaborator seams (policy, logical
//! backends, node-to-node forwarding) and metrics.

pub mod backend;
pub mod error;
pub mod forward_client;
pub mod locks;
pub mod metrics;
pub mod policy;
pub mod redis;
pub mod storage;

pub use backend::{KvBackend, LogicalBackend};
pub use error::{CoreError, ERR_CREATE_ENTITY_UNIMPLEMENTED};
pub use forward_client::HttpForwardingChannel;
pub use locks::{KeyedGuard, KeyedLocks};
pub use policy::{PathPolicyEngine, PolicyDecision, PolicyEngine};
pub use redis::{CacheStore, MemoryCache, RedisService};
pub use storage::{BatchOp, InMemoryStorage, Storage};
