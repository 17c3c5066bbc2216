use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use workflow_engine::ApprovalAction;

#[derive(Debug, Deserialize)]
pub struct RespondQuery {
    pub token: String,
    pub action: ApprovalAction,
}

#[derive(Debug, Default, Deserialize)]
pub struct RespondBody {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// External approve/reject callback. Browsers following an email link get
/// a self-contained HTML confirmation page; API clients get a JSON ack.
pub async fn respond(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    Query(query): Query<RespondQuery>,
    headers: HeaderMap,
    body: Option<Json<RespondBody>>,
) -> Result<Response, ApiError> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let mut payload = serde_json::Map::new();
    if let Some(comment) = body.comment {
        payload.insert("comment".to_string(), json!(comment));
    }
    if let Some(serde_json::Value::Object(data)) = body.data {
        for (key, value) in data {
            payload.entry(key).or_insert(value);
        }
    }

    let outcome = state
        .engine
        .respond_approval(&query.token, query.action, serde_json::Value::Object(payload))
        .await?;

    if outcome.execution_id != execution_id {
        return Err(ApiError::Unauthorized(
            "approval token does not match this execution".to_string(),
        ));
    }

    let wants_html = headers
        .get(header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false);

    let status = if outcome.approved { "Approved" } else { "Rejected" };
    if wants_html {
        Ok(Html(confirmation_page(status, outcome.execution_id)).into_response())
    } else {
        Ok(Json(json!({
            "execution_id": outcome.execution_id,
            "node_id": outcome.node_id,
            "status": status.to_lowercase(),
        }))
        .into_response())
    }
}

fn confirmation_page(status: &str, execution_id: Uuid) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Approval {status}</title>
  <style>
    body {{ font-family: sans-serif; max-width: 480px; margin: 4rem auto; text-align: center; }}
    .status {{ font-size: 1.5rem; margin-bottom: 1rem; }}
    code {{ font-family: monospace; background: #f4f4f4; padding: 0.2rem 0.4rem; border-radius: 4px; }}
  </style>
</head>
<body>
  <div class="status">{status}</div>
  <p>Execution <code>{execution_id}</code> has been updated.</p>
  <p>You can close this window.</p>
</body>
</html>
"#
    )
}
