use secrets_service::{
    build_cluster_router, build_router,
    config::{ClusterMode, SecretsConfig},
    models::ReplicationState,
    pipeline::{Collaborators, Core, NodeContext, WatchReplicationSource},
    services::{
        metrics::init_metrics, CacheStore, HttpForwardingChannel, InMemoryStorage, KvBackend,
        MemoryCache, PathPolicyEngine, RedisService, Storage,
    },
    AppState,
};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = SecretsConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );
    init_metrics();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        node_id = %config.cluster.node_id,
        mode = ?config.cluster.mode,
        role = ?config.cluster.node_role,
        "Starting secrets service"
    );

    let shutdown = CancellationToken::new();

    let cache: Arc<dyn CacheStore> = match &config.redis.url {
        Some(url) => Arc::new(RedisService::new(url).await?),
        None => {
            tracing::warn!("REDIS_URL not set; using in-process cache");
            let cache = Arc::new(MemoryCache::new());
            cache.spawn_purger(CACHE_PURGE_INTERVAL, shutdown.clone());
            cache
        }
    };
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());

    let policy = Arc::new(PathPolicyEngine::new());
    let backend = Arc::new(KvBackend::new(storage.clone()));
    let mut collaborators = Collaborators::new(policy, backend);

    let clustered = config.cluster.mode == ClusterMode::Clustered;
    if clustered {
        let timeout = config.cluster.forward_timeout();
        let secret = config.cluster.shared_secret.clone().ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("CLUSTER_SHARED_SECRET is required"))
        })?;
        if let Some(addr) = &config.cluster.active_node_addr {
            let channel = HttpForwardingChannel::new(addr, timeout, &secret)?;
            collaborators = collaborators.with_active_channel(Arc::new(channel));
        }
        if let Some(addr) = &config.cluster.primary_cluster_addr {
            let channel = HttpForwardingChannel::new(addr, timeout, &secret)?;
            collaborators = collaborators.with_primary_channel(Arc::new(channel));
        }
        // Storage is node-local, so the applied index only moves with local writes
        collaborators = collaborators
            .with_replication(Arc::new(WatchReplicationSource::new(ReplicationState::new(0))));
    }

    let addr = config.common.listen_addr();
    let cluster_addr = config.cluster.listen_addr;
    let service_name = config.service_name.clone();
    let ctx = NodeContext::new(config, storage, cache);
    let state = AppState::new(Core::new(ctx, collaborators));

    let service_span = tracing::info_span!("service", service = %service_name);
    let _guard = service_span.enter();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let cluster_server = if clustered {
        let listener = tokio::net::TcpListener::bind(cluster_addr).await?;
        tracing::info!(address = %cluster_addr, "Cluster listener ready");
        let app = build_cluster_router(state.clone());
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            service_core::axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }))
    } else {
        None
    };

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(state);

    let served = service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    })
    .await;

    // The cluster listener never outlives the client one
    shutdown.cancel();
    served?;
    if let Some(handle) = cluster_server {
        handle
            .await
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("cluster listener task: {}", e)))??;
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
