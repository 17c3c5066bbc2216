use crate::error::ApiError;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use state_store::{NodeKind, Workflow};
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Deserialize)]
struct WebhookRequest {
    workflow_id: Uuid,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    secret: Option<String>,
}

/// Normalizes an external trigger into an `execute` call. Returns the
/// execution id synchronously once the record exists, before any node
/// runs.
pub async fn trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: WebhookRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("malformed webhook body: {}", e)))?;

    let workflow = state.store.get_workflow(request.workflow_id).await?;
    let configured_secret = trigger_secret(&workflow)
        .or(state.config.webhook_secret.as_deref());

    if let Some(secret) = configured_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        let authorized = match signature {
            Some(signature) => verify_signature(secret, &body, signature),
            // Legacy callers send the shared secret in the body instead.
            None => request.secret.as_deref() == Some(secret),
        };
        if !authorized {
            return Err(ApiError::Unauthorized(
                "webhook signature verification failed".to_string(),
            ));
        }
    }

    debug!(workflow_id = %request.workflow_id, "Webhook trigger accepted");
    let execution_id = state
        .engine
        .execute(request.workflow_id, request.data, false)
        .await?;
    Ok(Json(json!({"execution_id": execution_id})))
}

fn trigger_secret(workflow: &Workflow) -> Option<&str> {
    workflow.nodes.iter().find_map(|node| match &node.kind {
        NodeKind::Trigger(config) => config.secret.as_deref(),
        _ => None,
    })
}

fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    match hex::decode(signature.trim_start_matches("sha256=")) {
        Ok(expected) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let body = br#"{"workflow_id":"x","data":{}}"#;
        let mut mac = HmacSha256::new_from_slice(b"shared").unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verify_signature("shared", body, &signature));
        assert!(verify_signature("shared", body, &format!("sha256={}", signature)));
        assert!(!verify_signature("other", body, &signature));
        assert!(!verify_signature("shared", b"tampered", &signature));
        assert!(!verify_signature("shared", body, "not-hex"));
    }
}
