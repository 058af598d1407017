//! Test helpers for secrets-service integration tests.
//!
//! Nodes are wired with in-process fakes: a login-capable backend, storage
//! that can be told to fail, a counting MFA validator, and a peer channel
//! that hands forwarded calls straight to another node's pipeline.

#![allow(dead_code)]

use async_trait::async_trait;
use secrets_service::{
    config::{NodeRole, SecretsConfig},
    models::{
        AliasCreation, AliasInfo, Auth, Entity, MfaCachedAuthResponse, Operation, ReplicationState,
        Request, Response, SecretLease,
    },
    pipeline::{
        Collaborators, Core, ForwardError, ForwardReply, ForwardingChannel, MfaValidator,
        NodeContext, WatchReplicationSource,
    },
    services::{
        BatchOp, CacheStore, CoreError, InMemoryStorage, KvBackend, LogicalBackend, MemoryCache,
        PathPolicyEngine, Storage,
    },
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const PASSWORD: &str = "correct-horse";
pub const PASSCODE: &str = "123456";
/// Login mount whose logins require a second factor.
pub const MFA_MOUNT: &str = "mfa-userpass";

/// KV engine plus `auth/<mount>/login/<user>` and `database/creds/<role>`.
pub struct LoginBackend {
    kv: KvBackend,
    pub executions: AtomicUsize,
    pub revoked: Mutex<Vec<SecretLease>>,
}

impl LoginBackend {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            kv: KvBackend::new(storage),
            executions: AtomicUsize::new(0),
            revoked: Mutex::new(Vec::new()),
        }
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn revoked(&self) -> usize {
        self.revoked.lock().unwrap().len()
    }
}

#[async_trait]
impl LogicalBackend for LoginBackend {
    async fn execute(&self, request: &Request) -> Result<Response, CoreError> {
        self.executions.fetch_add(1, Ordering::SeqCst);

        if let (Some(mount), Some(user)) = (request.login_mount(), request.login_user()) {
            if request.data.get("password").and_then(Value::as_str) != Some(PASSWORD) {
                return Err(CoreError::InvalidCredentials);
            }
            let mut auth = Auth::new(format!("s.{}", uuid::Uuid::new_v4()), &user.alias_name)
                .with_policies(&["default"])
                .with_alias(AliasInfo::new(
                    format!("{}-accessor", mount),
                    "userpass",
                    &user.alias_name,
                ));
            auth.mfa_required = mount == MFA_MOUNT;
            return Ok(Response::with_auth(auth));
        }

        if let Some(role) = request.path.strip_prefix("database/creds/") {
            let username = format!("v-{}-{}", role, &uuid::Uuid::new_v4().to_string()[..8]);
            let mut internal = Map::new();
            internal.insert("username".to_string(), Value::from(username.clone()));
            let mut data = Map::new();
            data.insert("username".to_string(), Value::from(username));
            return Ok(Response {
                data,
                secret: Some(SecretLease {
                    lease_id: None,
                    ttl_secs: 300,
                    renewable: true,
                    internal_data: internal,
                }),
                ..Default::default()
            });
        }

        self.kv.execute(request).await
    }

    async fn revoke(&self, _request: &Request, secret: &SecretLease) -> Result<(), CoreError> {
        self.revoked.lock().unwrap().push(secret.clone());
        Ok(())
    }
}

/// In-memory storage that rejects writes under a chosen prefix.
pub struct FlakyStorage {
    inner: InMemoryStorage,
    fail_prefix: Mutex<Option<String>>,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStorage::new(),
            fail_prefix: Mutex::new(None),
        }
    }

    pub fn fail_writes_under(&self, prefix: &str) {
        *self.fail_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    fn check(&self, key: &str) -> Result<(), CoreError> {
        match self.fail_prefix.lock().unwrap().as_deref() {
            Some(prefix) if key.starts_with(prefix) => {
                Err(CoreError::Storage(format!("injected write failure for {}", key)))
            }
            _ => Ok(()),
        }
    }

    pub async fn keys_under(&self, prefix: &str) -> Vec<String> {
        self.inner.list(prefix).await.unwrap()
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), CoreError> {
        self.check(key)?;
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        self.inner.list(prefix).await
    }

    async fn put_batch(&self, ops: Vec<BatchOp>) -> Result<(), CoreError> {
        for op in &ops {
            if let BatchOp::Put(key, _) = op {
                self.check(key)?;
            }
        }
        self.inner.put_batch(ops).await
    }
}

/// Accepts the login when `passcode` matches; counts every validation.
pub struct CountingMfa {
    pub calls: AtomicUsize,
}

impl CountingMfa {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MfaValidator for CountingMfa {
    async fn validate(&self, request: &Request, _auth: &Auth) -> Result<(), CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request.data.get("passcode").and_then(Value::as_str) {
            Some(PASSCODE) => Ok(()),
            _ => Err(CoreError::MfaValidationFailed("invalid passcode".to_string())),
        }
    }
}

/// Peer channel that serves calls from another node's pipeline, passing
/// replies through the same JSON envelope the HTTP channel uses.
pub struct PeerChannel {
    target: Arc<Core>,
    pub calls: AtomicUsize,
    unreachable: AtomicBool,
    hanging: AtomicBool,
    injected: Mutex<Option<CoreError>>,
}

impl PeerChannel {
    pub fn new(target: Arc<Core>) -> Self {
        Self {
            target,
            calls: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
            injected: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Accepted calls never answer, like a peer stuck mid-request.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// The next forwarded request fails on the peer with `err`.
    pub fn inject_error(&self, err: CoreError) {
        *self.injected.lock().unwrap() = Some(err);
    }

    async fn begin(&self) -> Result<(), ForwardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ForwardError::Unreachable("connection refused".to_string()));
        }
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

fn over_wire<T>(result: Result<T, CoreError>) -> Result<T, ForwardError>
where
    T: Serialize + DeserializeOwned,
{
    let reply: ForwardReply<T> = result.into();
    let wire = serde_json::to_vec(&reply).map_err(|e| ForwardError::Transport(e.to_string()))?;
    serde_json::from_slice::<ForwardReply<T>>(&wire)
        .map_err(|e| ForwardError::Transport(e.to_string()))?
        .into_result()
}

#[async_trait]
impl ForwardingChannel for PeerChannel {
    async fn forward_request(&self, request: &Request) -> Result<Response, ForwardError> {
        self.begin().await?;
        if let Some(err) = self.injected.lock().unwrap().take() {
            return over_wire(Err(err));
        }
        over_wire(
            self.target
                .handle_forwarded_request(request.clone(), CancellationToken::new())
                .await,
        )
    }

    async fn forward_alias_creation(
        &self,
        creation: &AliasCreation,
    ) -> Result<Entity, ForwardError> {
        self.begin().await?;
        over_wire(self.target.identity().create_alias(creation).await)
    }

    async fn forward_entity_creation(&self, entity: &Entity) -> Result<Entity, ForwardError> {
        self.begin().await?;
        over_wire(self.target.identity().create_entity(entity).await)
    }

    async fn forward_mfa_response(
        &self,
        entry: &MfaCachedAuthResponse,
    ) -> Result<(), ForwardError> {
        self.begin().await?;
        over_wire(self.target.save_forwarded_mfa_response(entry).await)
    }
}

/// A standalone node and the fakes behind it.
pub struct TestNode {
    pub core: Arc<Core>,
    pub backend: Arc<LoginBackend>,
    pub storage: Arc<FlakyStorage>,
    pub mfa: Arc<CountingMfa>,
}

pub fn standalone_config() -> SecretsConfig {
    let mut config = SecretsConfig::standalone();
    config.lockout.threshold = 3;
    config.mfa.cache_ttl_seconds = 60;
    config
}

pub fn standalone(config: SecretsConfig, policy: PathPolicyEngine) -> TestNode {
    let storage = Arc::new(FlakyStorage::new());
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
    let backend = Arc::new(LoginBackend::new(storage.clone()));
    let mfa = Arc::new(CountingMfa::new());

    let collaborators =
        Collaborators::new(Arc::new(policy), backend.clone()).with_mfa_validator(mfa.clone());
    let ctx = NodeContext::new(config, storage.clone(), cache);

    TestNode {
        core: Arc::new(Core::new(ctx, collaborators)),
        backend,
        storage,
        mfa,
    }
}

/// An active node and a standby sharing storage and cache, the standby
/// reaching the active node through a [`PeerChannel`].
pub struct TestCluster {
    pub active: Arc<Core>,
    pub standby: Arc<Core>,
    pub active_backend: Arc<LoginBackend>,
    pub standby_backend: Arc<LoginBackend>,
    pub channel: Arc<PeerChannel>,
    pub replication: Arc<WatchReplicationSource>,
    pub storage: Arc<FlakyStorage>,
}

pub fn cluster_config(node_id: &str, role: NodeRole) -> SecretsConfig {
    let mut config = SecretsConfig::clustered(node_id, role, Some("http://active.internal:8200"));
    config.cluster.forward_max_retries = 2;
    config.cluster.forward_timeout_ms = 1000;
    config.replication.wait_timeout_ms = 500;
    config
}

pub fn cluster(policy: fn() -> PathPolicyEngine) -> TestCluster {
    let storage = Arc::new(FlakyStorage::new());
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
    let replication = Arc::new(WatchReplicationSource::new(ReplicationState::new(0)));
    let mfa = Arc::new(CountingMfa::new());

    let active_backend = Arc::new(LoginBackend::new(storage.clone()));
    let active = Arc::new(Core::new(
        NodeContext::new(
            cluster_config("node-a", NodeRole::Active),
            storage.clone(),
            cache.clone(),
        ),
        Collaborators::new(Arc::new(policy()), active_backend.clone())
            .with_replication(replication.clone())
            .with_mfa_validator(mfa.clone()),
    ));

    let channel = Arc::new(PeerChannel::new(active.clone()));
    let standby_backend = Arc::new(LoginBackend::new(storage.clone()));
    let standby = Arc::new(Core::new(
        NodeContext::new(
            cluster_config("node-b", NodeRole::Standby),
            storage.clone(),
            cache,
        ),
        Collaborators::new(Arc::new(policy()), standby_backend.clone())
            .with_replication(replication.clone())
            .with_active_channel(channel.clone())
            .with_mfa_validator(mfa),
    ));

    TestCluster {
        active,
        standby,
        active_backend,
        standby_backend,
        channel,
        replication,
        storage,
    }
}

pub fn login(mount: &str, user: &str, password: &str) -> Request {
    Request::new(Operation::Update, format!("auth/{}/login/{}", mount, user))
        .with_field("password", password)
        .with_remote_addr("10.0.0.7")
}

pub async fn handle(core: &Core, request: Request) -> Result<Response, CoreError> {
    core.handle_request(request, CancellationToken::new()).await
}

/// Log `user` in on the userpass mount and return the client token.
pub async fn token_for(core: &Core, user: &str) -> String {
    let response = handle(core, login("userpass", user, PASSWORD))
        .await
        .expect("login failed");
    response.auth.expect("login returned no auth").client_token
}
