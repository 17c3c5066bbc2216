use ai_router::{AiRouter, RouterConfig};
use coordination_service::{CacheService, LockManager, RateLimiter};
use event_bus::EventBus;
use orchestrator_server::{build_router, AppState, ServerConfig};
use state_store::MemoryStore;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use workflow_engine::{
    ApprovalService, EngineConfig, LoggedEventSink, Notifier, WorkflowEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(ServerConfig::from_env());

    // The in-process store backs this build; DATABASE_URL / EVENT_STORE_URL
    // select a durable document database behind the same adapter trait.
    if env::var("DATABASE_URL").is_ok() || env::var("EVENT_STORE_URL").is_ok() {
        info!("DATABASE_URL set; state-store runs in-memory in this build");
    }
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::default();
    let (locks, cache, limiter) = build_coordination().await?;
    let sink = Arc::new(LoggedEventSink::new(store.clone(), bus.clone()));

    let router = Arc::new(AiRouter::new(
        RouterConfig::from_env(),
        limiter.clone(),
        sink.clone(),
    ));

    let approval_secret = env::var("APPROVAL_HMAC_SECRET").unwrap_or_else(|_| {
        warn!("APPROVAL_HMAC_SECRET not set; using an ephemeral secret");
        uuid::Uuid::new_v4().to_string()
    });
    let approvals = Arc::new(ApprovalService::new(approval_secret.into_bytes(), sink));
    let notifier = Notifier::new(env::var("NOTIFIER_URL").ok());

    let mut engine_config = EngineConfig::default();
    if let Some(workers) = env::var("WORKER_POOL_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        engine_config.worker_count = workers;
    }

    let engine = WorkflowEngine::new(
        store.clone(),
        bus.clone(),
        locks,
        router.clone(),
        approvals,
        notifier,
        engine_config,
    );
    engine.start();
    let orphaned = engine.recover().await?;
    if orphaned > 0 {
        warn!(orphaned, "Failed orphaned executions from a previous run");
    }

    let state = AppState {
        engine,
        store,
        bus,
        cache,
        limiter,
        router,
        config: config.clone(),
    };
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Orchestrator server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Coordination primitives share one backing choice: Redis when the
/// `redis-backend` feature is enabled and REDIS_URL is set, in-process
/// otherwise.
#[cfg(feature = "redis-backend")]
async fn build_coordination(
) -> anyhow::Result<(Arc<LockManager>, Arc<CacheService>, Arc<RateLimiter>)> {
    use coordination_service::RedisCoordination;

    match env::var("REDIS_URL") {
        Ok(url) => {
            let redis = Arc::new(RedisCoordination::connect(&url).await?);
            info!("Coordination primitives backed by Redis");
            Ok((
                Arc::new(LockManager::with_redis(redis.clone())),
                Arc::new(CacheService::with_redis(redis.clone())),
                Arc::new(RateLimiter::with_redis(redis)),
            ))
        }
        Err(_) => {
            warn!("redis-backend enabled but REDIS_URL not set; using in-process coordination");
            Ok((
                Arc::new(LockManager::new()),
                Arc::new(CacheService::new()),
                Arc::new(RateLimiter::new()),
            ))
        }
    }
}

#[cfg(not(feature = "redis-backend"))]
async fn build_coordination(
) -> anyhow::Result<(Arc<LockManager>, Arc<CacheService>, Arc<RateLimiter>)> {
    Ok((
        Arc::new(LockManager::new()),
        Arc::new(CacheService::new()),
        Arc::new(RateLimiter::new()),
    ))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("Failed to install the shutdown signal handler");
    }
    info!("Shutting down");
}
