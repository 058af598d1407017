//! Identity resolver.
//!
//! Maps the alias an auth method reports to the entity that owns it, creating
//! both on first login. Only the identity-authoritative node writes replicated
//! identity records; every other node hands the write over and remembers the
//! answer in a node-local index until replication catches up.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

use super::{ForwardingClient, NodeContext, NodeState, Outcome};
use crate::models::identity::entity_storage_key;
use crate::models::{Alias, AliasCreation, AliasKey, Auth, Entity};
use crate::services::storage::{get_json, put_json, put_op};
use crate::services::{BatchOp, CoreError, KeyedLocks, ERR_CREATE_ENTITY_UNIMPLEMENTED};

/// Where identity writes go in this topology.
#[async_trait]
pub trait IdentityWrites: Send + Sync {
    fn is_authoritative(&self) -> bool;

    /// `NotApplicable` means this node creates the alias itself.
    async fn possibly_forward_alias_creation(
        &self,
        creation: &AliasCreation,
    ) -> Result<Outcome<Entity>, CoreError>;

    /// `NotApplicable` means this node creates the entity itself.
    async fn possibly_forward_entity_creation(
        &self,
        entity: &Entity,
    ) -> Result<Outcome<Entity>, CoreError>;
}

/// Standalone node: every identity write is local.
pub struct LocalIdentityWrites;

#[async_trait]
impl IdentityWrites for LocalIdentityWrites {
    fn is_authoritative(&self) -> bool {
        true
    }

    async fn possibly_forward_alias_creation(
        &self,
        _creation: &AliasCreation,
    ) -> Result<Outcome<Entity>, CoreError> {
        Ok(Outcome::NotApplicable)
    }

    async fn possibly_forward_entity_creation(
        &self,
        _entity: &Entity,
    ) -> Result<Outcome<Entity>, CoreError> {
        Ok(Outcome::NotApplicable)
    }
}

/// Cluster member: writes go to the active node, or from a performance
/// secondary to the primary cluster.
pub struct ForwardedIdentityWrites {
    state: Arc<NodeState>,
    active: Option<ForwardingClient>,
    primary: Option<ForwardingClient>,
}

impl ForwardedIdentityWrites {
    pub fn new(
        state: Arc<NodeState>,
        active: Option<ForwardingClient>,
        primary: Option<ForwardingClient>,
    ) -> Self {
        Self {
            state,
            active,
            primary,
        }
    }

    fn target(&self) -> Result<&ForwardingClient, CoreError> {
        let target = if self.state.is_active() && self.state.is_performance_secondary() {
            self.primary.as_ref()
        } else {
            self.active.as_ref()
        };
        target.ok_or_else(|| {
            CoreError::IdentityCreationUnimplemented(ERR_CREATE_ENTITY_UNIMPLEMENTED.to_string())
        })
    }
}

#[async_trait]
impl IdentityWrites for ForwardedIdentityWrites {
    fn is_authoritative(&self) -> bool {
        self.state.is_identity_authoritative()
    }

    async fn possibly_forward_alias_creation(
        &self,
        creation: &AliasCreation,
    ) -> Result<Outcome<Entity>, CoreError> {
        if self.is_authoritative() {
            return Ok(Outcome::NotApplicable);
        }
        let entity = self.target()?.forward_alias_creation(creation).await?;
        tracing::info!(
            entity_id = %entity.id,
            alias = %creation.alias.name,
            "Alias creation forwarded"
        );
        Ok(Outcome::Applied(entity))
    }

    async fn possibly_forward_entity_creation(
        &self,
        entity: &Entity,
    ) -> Result<Outcome<Entity>, CoreError> {
        if self.is_authoritative() {
            return Ok(Outcome::NotApplicable);
        }
        let created = self.target()?.forward_entity_creation(entity).await?;
        Ok(Outcome::Applied(created))
    }
}

pub struct IdentityResolver {
    ctx: NodeContext,
    writes: Arc<dyn IdentityWrites>,
    locks: KeyedLocks<AliasKey>,
    /// Taken before any alias lock when an existing entity is rewritten.
    entity_locks: KeyedLocks<String>,
    /// Aliases this node has resolved, including ones created elsewhere and
    /// not yet replicated here.
    local_index: DashMap<AliasKey, Entity>,
}

impl IdentityResolver {
    pub fn new(ctx: NodeContext, writes: Arc<dyn IdentityWrites>) -> Self {
        Self {
            ctx,
            writes,
            locks: KeyedLocks::new(),
            entity_locks: KeyedLocks::new(),
            local_index: DashMap::new(),
        }
    }

    /// Entity owning the login's alias, created on first login.
    pub async fn resolve(&self, auth: &Auth) -> Result<Outcome<Entity>, CoreError> {
        let Some(info) = &auth.alias else {
            return Ok(Outcome::NotApplicable);
        };
        let key = AliasKey::from(info);

        if let Some(entity) = self.lookup(&key).await? {
            return Ok(Outcome::Applied(entity));
        }

        let _guard = self.locks.lock(key.clone()).await;
        // Another login for the same alias may have won the race
        if let Some(entity) = self.lookup(&key).await? {
            return Ok(Outcome::Applied(entity));
        }

        let creation = AliasCreation {
            alias: info.clone(),
        };

        let entity = if info.local {
            self.create_local_alias(&creation).await?
        } else {
            match self.writes.possibly_forward_alias_creation(&creation).await? {
                Outcome::Applied(entity) => {
                    self.update_local_alias(&entity, &Alias::new(&entity.id, info));
                    entity
                }
                Outcome::NotApplicable => self.create_alias_locked(&creation).await?,
            }
        };

        Ok(Outcome::Applied(entity))
    }

    /// Record an alias-to-entity mapping in the node-local index.
    pub fn update_local_alias(&self, entity: &Entity, alias: &Alias) {
        self.local_index.insert(alias.key(), entity.clone());
    }

    /// Alias creation on the authoritative node, for local logins and
    /// forwarded ones alike. Idempotent per alias.
    pub async fn create_alias(&self, creation: &AliasCreation) -> Result<Entity, CoreError> {
        self.require_authoritative()?;
        let key = AliasKey::from(&creation.alias);
        let _guard = self.locks.lock(key.clone()).await;
        if let Some(entity) = self.lookup(&key).await? {
            return Ok(entity);
        }
        self.create_alias_locked(creation).await
    }

    /// Entity creation on the authoritative node. Idempotent per entity id.
    pub async fn create_entity(&self, entity: &Entity) -> Result<Entity, CoreError> {
        self.require_authoritative()?;
        let _guard = self.entity_locks.lock(entity.id.clone()).await;
        if let Some(existing) = self.read_entity(&entity.id).await? {
            return Ok(existing);
        }
        put_json(self.ctx.storage.as_ref(), &entity.storage_key(), entity).await?;
        tracing::info!(entity_id = %entity.id, "Entity created");
        Ok(entity.clone())
    }

    pub async fn read_entity(&self, id: &str) -> Result<Option<Entity>, CoreError> {
        get_json(self.ctx.storage.as_ref(), &entity_storage_key(id)).await
    }

    /// Move every alias of `from` onto `into` and delete `from`, in one batch.
    pub async fn merge_entities(&self, from: &str, into: &str) -> Result<Entity, CoreError> {
        self.require_authoritative()?;
        if from == into {
            return Err(CoreError::InvalidRequest(
                "cannot merge an entity into itself".to_string(),
            ));
        }

        // Both entities, in sorted order, so overlapping merges serialize
        // instead of resurrecting an entity the other merge just deleted
        let mut ids = [from.to_string(), into.to_string()];
        ids.sort();
        let [first, second] = ids;
        let _first = self.entity_locks.lock(first).await;
        let _second = self.entity_locks.lock(second).await;

        let source = self
            .read_entity(from)
            .await?
            .ok_or_else(|| CoreError::InvalidRequest(format!("unknown entity {}", from)))?;

        // Sorted so two merges touching the same aliases cannot deadlock
        let mut keys = source.aliases.clone();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.locks.lock(key.clone()).await);
        }

        let mut target = self
            .read_entity(into)
            .await?
            .ok_or_else(|| CoreError::InvalidRequest(format!("unknown entity {}", into)))?;

        let storage = self.ctx.storage.as_ref();
        let mut ops: Vec<BatchOp> = Vec::with_capacity(keys.len() + 2);
        let mut moved = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(mut alias) = get_json::<Alias>(storage, &key.storage_key()).await? {
                alias.entity_id = target.id.clone();
                ops.push(put_op(key.storage_key(), &alias)?);
                moved.push(key.clone());
            }
        }

        for key in &moved {
            if !target.aliases.contains(key) {
                target.aliases.push(key.clone());
            }
        }
        target.merged_entity_ids.push(source.id.clone());
        target
            .merged_entity_ids
            .extend(source.merged_entity_ids.iter().cloned());
        for policy in &source.policies {
            if !target.policies.contains(policy) {
                target.policies.push(policy.clone());
            }
        }
        target.updated_at = Utc::now();

        ops.push(put_op(target.storage_key(), &target)?);
        ops.push(BatchOp::Delete(source.storage_key()));
        storage.put_batch(ops).await?;

        for key in moved {
            self.local_index.insert(key, target.clone());
        }
        drop(guards);

        tracing::info!(from = %source.id, into = %target.id, "Entities merged");
        Ok(target)
    }

    fn require_authoritative(&self) -> Result<(), CoreError> {
        if self.writes.is_authoritative() {
            Ok(())
        } else {
            Err(CoreError::NotActiveNode)
        }
    }

    async fn lookup(&self, key: &AliasKey) -> Result<Option<Entity>, CoreError> {
        let storage = self.ctx.storage.as_ref();
        if let Some(alias) = get_json::<Alias>(storage, &key.storage_key()).await? {
            if let Some(entity) = self.read_entity(&alias.entity_id).await? {
                self.update_local_alias(&entity, &alias);
                return Ok(Some(entity));
            }
        }
        Ok(self.local_index.get(key).map(|entry| entry.value().clone()))
    }

    /// Caller holds the alias lock.
    async fn create_alias_locked(&self, creation: &AliasCreation) -> Result<Entity, CoreError> {
        let mut entity = Entity::new();

        let alias = Alias::new(&entity.id, &creation.alias);
        entity.aliases.push(alias.key());
        entity.updated_at = Utc::now();

        self.ctx
            .storage
            .put_batch(vec![
                put_op(entity.storage_key(), &entity)?,
                put_op(alias.key().storage_key(), &alias)?,
            ])
            .await?;

        tracing::info!(
            entity_id = %entity.id,
            mount_accessor = %alias.mount_accessor,
            alias = %alias.name,
            "Alias created"
        );
        self.update_local_alias(&entity, &alias);
        Ok(entity)
    }

    /// Aliases on node-local mounts stay on this node; only their entity is
    /// created where entities are authoritative.
    async fn create_local_alias(&self, creation: &AliasCreation) -> Result<Entity, CoreError> {
        let entity = match self
            .writes
            .possibly_forward_entity_creation(&Entity::new())
            .await?
        {
            Outcome::Applied(entity) => entity,
            Outcome::NotApplicable => return self.create_alias_locked(creation).await,
        };

        let alias = Alias::new(&entity.id, &creation.alias);
        put_json(self.ctx.storage.as_ref(), &alias.key().storage_key(), &alias).await?;
        tracing::info!(
            entity_id = %entity.id,
            alias = %alias.name,
            "Local alias created"
        );
        self.update_local_alias(&entity, &alias);
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeRole, ReplicationRole, SecretsConfig};
    use crate::models::AliasInfo;
    use crate::services::{InMemoryStorage, MemoryCache, Storage};
    use std::time::Duration;

    fn resolver(config: SecretsConfig, writes: Option<Arc<dyn IdentityWrites>>) -> (IdentityResolver, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let ctx = NodeContext::new(config, storage.clone(), Arc::new(MemoryCache::new()));
        let writes = writes.unwrap_or_else(|| Arc::new(LocalIdentityWrites));
        (IdentityResolver::new(ctx, writes), storage)
    }

    /// Reads yield to the scheduler so interleavings actually happen.
    struct SlowStorage(InMemoryStorage);

    #[async_trait]
    impl Storage for SlowStorage {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.0.get(key).await
        }
        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CoreError> {
            self.0.put(key, value).await
        }
        async fn delete(&self, key: &str) -> Result<(), CoreError> {
            self.0.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
            self.0.list(prefix).await
        }
        async fn put_batch(&self, ops: Vec<BatchOp>) -> Result<(), CoreError> {
            self.0.put_batch(ops).await
        }
    }

    fn login(name: &str) -> Auth {
        Auth::new("tok", name).with_alias(AliasInfo::new("mount-userpass", "userpass", name))
    }

    #[tokio::test]
    async fn test_first_login_creates_entity_once() {
        let (resolver, storage) = resolver(SecretsConfig::standalone(), None);

        let first = resolver.resolve(&login("alice")).await.unwrap().applied().unwrap();
        let stored = storage.len().await;
        let second = resolver.resolve(&login("alice")).await.unwrap().applied().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(storage.len().await, stored);
        assert_eq!(first.aliases, vec![AliasKey::new("mount-userpass", "alice")]);
    }

    #[tokio::test]
    async fn test_auth_without_alias_is_not_applicable() {
        let (resolver, _) = resolver(SecretsConfig::standalone(), None);
        let outcome = resolver.resolve(&Auth::new("tok", "root")).await.unwrap();
        assert_eq!(outcome, Outcome::NotApplicable);
    }

    #[tokio::test]
    async fn test_secondary_without_primary_refuses_creation() {
        let mut config = SecretsConfig::clustered("s1", NodeRole::Active, None);
        config.cluster.replication_role = ReplicationRole::PerformanceSecondary;
        let state = Arc::new(NodeState::from_config(&config));
        let writes = Arc::new(ForwardedIdentityWrites::new(state, None, None));
        let (resolver, storage) = resolver(config, Some(writes));

        let err = resolver.resolve(&login("bob")).await.unwrap_err();
        assert_eq!(
            err,
            CoreError::IdentityCreationUnimplemented(ERR_CREATE_ENTITY_UNIMPLEMENTED.to_string())
        );
        assert!(err.is_terminal());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_merge_moves_every_alias() {
        let (resolver, storage) = resolver(SecretsConfig::standalone(), None);
        let a = resolver.resolve(&login("alice")).await.unwrap().applied().unwrap();
        let b = resolver.resolve(&login("alice-admin")).await.unwrap().applied().unwrap();

        let merged = resolver.merge_entities(&a.id, &b.id).await.unwrap();
        assert_eq!(merged.id, b.id);
        assert_eq!(merged.aliases.len(), 2);
        assert_eq!(merged.merged_entity_ids, vec![a.id.clone()]);
        assert!(resolver.read_entity(&a.id).await.unwrap().is_none());

        let alias: Alias = get_json(storage.as_ref(), &AliasKey::new("mount-userpass", "alice").storage_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alias.entity_id, b.id);

        let again = resolver.resolve(&login("alice")).await.unwrap().applied().unwrap();
        assert_eq!(again.id, b.id);
    }

    #[tokio::test]
    async fn test_merge_into_self_rejected() {
        let (resolver, _) = resolver(SecretsConfig::standalone(), None);
        let a = resolver.resolve(&login("alice")).await.unwrap().applied().unwrap();
        assert!(matches!(
            resolver.merge_entities(&a.id, &a.id).await,
            Err(CoreError::InvalidRequest(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_merges_keep_one_entity_per_alias() {
        let storage = Arc::new(SlowStorage(InMemoryStorage::new()));
        let ctx = NodeContext::new(SecretsConfig::standalone(), storage.clone(), Arc::new(MemoryCache::new()));
        let resolver = Arc::new(IdentityResolver::new(ctx, Arc::new(LocalIdentityWrites)));

        let names = ["alice", "bob", "carol"];
        let mut ids = Vec::new();
        for name in names {
            ids.push(resolver.resolve(&login(name)).await.unwrap().applied().unwrap().id);
        }

        let merges = {
            let (r1, r2) = (resolver.clone(), resolver.clone());
            let (a, b1) = (ids[0].clone(), ids[1].clone());
            let (b2, c) = (ids[1].clone(), ids[2].clone());
            tokio::join!(
                tokio::spawn(async move { r1.merge_entities(&a, &b1).await }),
                tokio::spawn(async move { r2.merge_entities(&b2, &c).await }),
            )
        };
        let (ab, bc) = (merges.0.unwrap(), merges.1.unwrap());
        assert!(ab.is_ok() || bc.is_ok());

        let mut owners = Vec::new();
        for id in &ids {
            if let Some(entity) = resolver.read_entity(id).await.unwrap() {
                owners.push(entity);
            }
        }
        for name in names {
            let key = AliasKey::new("mount-userpass", name);
            let alias: Alias = get_json(storage.as_ref(), &key.storage_key()).await.unwrap().unwrap();
            let holder = owners
                .iter()
                .find(|entity| entity.id == alias.entity_id)
                .expect("alias points at a deleted entity");
            assert!(holder.aliases.contains(&key));
            assert_eq!(owners.iter().filter(|entity| entity.aliases.contains(&key)).count(), 1);
        }
    }
}
