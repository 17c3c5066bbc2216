use crate::config::ServerConfig;
use ai_router::AiRouter;
use coordination_service::{CacheService, RateLimiter};
use event_bus::EventBus;
use state_store::StateStore;
use std::sync::Arc;
use workflow_engine::WorkflowEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
    pub store: Arc<dyn StateStore>,
    pub bus: EventBus,
    pub cache: Arc<CacheService>,
    pub limiter: Arc<RateLimiter>,
    pub router: Arc<AiRouter>,
    pub config: Arc<ServerConfig>,
}
