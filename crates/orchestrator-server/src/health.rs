use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::json;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "orchestrator-server",
        "providers": state.router.provider_health(),
        "bus_subscribers": state.bus.subscriber_count(),
        "rate_limit_failures": state.limiter.failed_check_count(),
        "timestamp": Utc::now(),
    }))
}
