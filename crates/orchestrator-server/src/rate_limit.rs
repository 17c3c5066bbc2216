use crate::auth::{ANONYMOUS, PRINCIPAL_HEADER};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use coordination_service::RateLimitDecision;
use serde_json::json;

static LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Fixed-window admission per client, stamping `X-RateLimit-*` on every
/// response and `Retry-After` on rejections.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client = request
        .headers()
        .get(PRINCIPAL_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string();

    let tier = state.config.rate_limit;
    let decision = state
        .limiter
        .check("api", &client, tier.window_ms, tier.max_requests)
        .await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        rejected(&decision)
    };
    stamp_headers(&mut response, &decision);
    response
}

fn rejected(decision: &RateLimitDecision) -> Response {
    let retry_after_secs = (decision.retry_after_ms as f64 / 1000.0).ceil() as u64;
    let body = json!({
        "error": "rate_limited",
        "message": "rate limit exceeded; retry later",
        "code": StatusCode::TOO_MANY_REQUESTS.as_u16(),
        "timestamp": Utc::now(),
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        response.headers_mut().insert(RETRY_AFTER, value);
    }
    response
}

fn stamp_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert(LIMIT_HEADER.clone(), value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert(REMAINING_HEADER.clone(), value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_at_ms.to_string()) {
        headers.insert(RESET_HEADER.clone(), value);
    }
}
