//! HTTP surface for the orchestration engine
//!
//! REST endpoints for workflows, executions and approvals, webhook
//! ingress, a WebSocket bridge and Server-Sent-Event streams. All routes
//! sit behind the rate-limit middleware, which stamps `X-RateLimit-*`
//! headers on every response.

pub mod approvals;
pub mod auth;
pub mod config;
pub mod error;
pub mod executions;
pub mod health;
pub mod rate_limit;
pub mod state;
pub mod webhooks;
pub mod workflows;
pub mod ws;

pub use config::ServerConfig;
pub use state::AppState;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/workflows", post(workflows::create).get(workflows::list))
        .route(
            "/workflows/:id",
            put(workflows::update)
                .get(workflows::get)
                .delete(workflows::archive),
        )
        .route("/workflows/:id/stats", get(workflows::stats))
        .route("/workflows/:id/execute", post(workflows::execute))
        .route("/executions/:id", get(executions::get))
        .route("/executions/:id/pause", post(executions::pause))
        .route("/executions/:id/resume", post(executions::resume))
        .route("/executions/:id/cancel", post(executions::cancel))
        .route("/executions/:id/events", get(executions::events))
        .route("/approvals/:execution_id/respond", post(approvals::respond))
        .route("/webhooks/workflow-trigger", post(webhooks::trigger))
        .route("/ws", get(ws::upgrade))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
