//! HTTP surface tests against a server bound to an ephemeral port.

use ai_router::{AiRouter, RouterConfig};
use coordination_service::{CacheService, LockManager, RateLimiter};
use event_bus::EventBus;
use hmac::{Hmac, Mac};
use orchestrator_server::{build_router, AppState, ServerConfig};
use orchestrator_server::config::RateLimitTier;
use serde_json::{json, Value};
use sha2::Sha256;
use state_store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use workflow_engine::{
    ApprovalService, EngineConfig, LoggedEventSink, Notifier, WorkflowEngine,
};

fn test_state(rate_max: u64) -> AppState {
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::default();
    let locks = Arc::new(LockManager::new());
    let limiter = Arc::new(RateLimiter::new());
    let sink = Arc::new(LoggedEventSink::new(store.clone(), bus.clone()));
    let router = Arc::new(AiRouter::new(
        RouterConfig::default(),
        limiter.clone(),
        sink.clone(),
    ));
    let approvals = Arc::new(ApprovalService::new(b"api-test-secret".to_vec(), sink));
    let engine = WorkflowEngine::new(
        store.clone(),
        bus.clone(),
        locks,
        router.clone(),
        approvals,
        Notifier::disabled(),
        EngineConfig {
            worker_count: 4,
            lock_retry_delay: Duration::from_millis(5),
            ..Default::default()
        },
    );
    engine.start();
    AppState {
        engine,
        store,
        bus,
        cache: Arc::new(CacheService::new()),
        limiter,
        router,
        config: Arc::new(ServerConfig {
            port: 0,
            webhook_secret: None,
            rate_limit: RateLimitTier {
                window_ms: 60_000,
                max_requests: rate_max,
            },
        }),
    }
}

async fn spawn_app(rate_max: u64) -> String {
    let state = test_state(rate_max);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn simple_workflow_body(name: &str) -> Value {
    json!({
        "name": name,
        "description": "test workflow",
        "status": "active",
        "nodes": [
            {"id": "T", "kind": "trigger", "config": {}},
            {"id": "O", "kind": "data_output", "config": {}}
        ],
        "edges": [
            {"id": "e1", "source": "T", "target": "O"}
        ]
    })
}

fn approval_workflow_body(name: &str) -> Value {
    json!({
        "name": name,
        "status": "active",
        "nodes": [
            {"id": "T", "kind": "trigger", "config": {}},
            {"id": "HT", "kind": "human_task", "config": {
                "assignee": "u@example.com",
                "timeout_ms": 60000,
                "fallback": "cancel"
            }},
            {"id": "P", "kind": "data_output", "config": {}}
        ],
        "edges": [
            {"id": "e1", "source": "T", "target": "HT"},
            {"id": "e2", "source": "HT", "target": "P"}
        ]
    })
}

async fn wait_for_execution_status(
    client: &reqwest::Client,
    base: &str,
    execution_id: &str,
    status: &str,
) -> Value {
    for _ in 0..500 {
        let body: Value = client
            .get(format!("{}/executions/{}", base, execution_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["execution"]["status"] == status {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution never reached {}", status);
}

#[tokio::test]
async fn workflow_crud_round_trip() {
    let base = spawn_app(10_000).await;
    let client = reqwest::Client::new();

    let created: Value = {
        let response = client
            .post(format!("{}/workflows", base))
            .header("x-user-id", "alice")
            .json(&simple_workflow_body("crud"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        response.json().await.unwrap()
    };
    let id = created["id"].as_str().unwrap();
    assert_eq!(created["version"], 1);

    // Read it back; a stranger is rejected.
    let fetched: Value = client
        .get(format!("{}/workflows/{}", base, id))
        .header("x-user-id", "alice")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["name"], "crud");

    let forbidden = client
        .get(format!("{}/workflows/{}", base, id))
        .header("x-user-id", "mallory")
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), 403);

    // Update bumps the version; a stale version conflicts.
    let mut update = simple_workflow_body("crud-renamed");
    update["version"] = json!(1);
    let updated: Value = client
        .put(format!("{}/workflows/{}", base, id))
        .header("x-user-id", "alice")
        .json(&update)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["version"], 2);

    let conflict = client
        .put(format!("{}/workflows/{}", base, id))
        .header("x-user-id", "alice")
        .json(&update)
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), 409);
    let envelope: Value = conflict.json().await.unwrap();
    assert_eq!(envelope["error"], "conflict");
    assert!(envelope["message"].as_str().is_some());
    assert!(envelope["timestamp"].as_str().is_some());
}

#[tokio::test]
async fn execute_and_poll_to_completion() {
    let base = spawn_app(10_000).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/workflows", base))
        .header("x-user-id", "alice")
        .json(&simple_workflow_body("run-me"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workflow_id = created["id"].as_str().unwrap();

    let response = client
        .post(format!("{}/workflows/{}/execute", base, workflow_id))
        .json(&json!({"trigger_data": {"count": 7}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let accepted: Value = response.json().await.unwrap();
    let execution_id = accepted["execution_id"].as_str().unwrap().to_string();

    let body = wait_for_execution_status(&client, &base, &execution_id, "completed").await;
    assert_eq!(body["progress"]["total_nodes"], 2);
    assert_eq!(body["progress"]["completed_nodes"], 2);
    assert_eq!(body["execution"]["variables"]["input"]["count"], 7);

    let kinds: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds.first(), Some(&"workflow_started"));
    assert_eq!(kinds.last(), Some(&"workflow_completed"));
}

#[tokio::test]
async fn approval_flow_over_http_with_html_confirmation() {
    let base = spawn_app(10_000).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/workflows", base))
        .header("x-user-id", "alice")
        .json(&approval_workflow_body("approve-me"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workflow_id = created["id"].as_str().unwrap();

    let accepted: Value = client
        .post(format!("{}/workflows/{}/execute", base, workflow_id))
        .json(&json!({"trigger_data": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let execution_id = accepted["execution_id"].as_str().unwrap().to_string();

    let body = wait_for_execution_status(&client, &base, &execution_id, "paused").await;
    let token = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["kind"] == "human_approval_requested")
        .and_then(|e| e["payload"]["token"].as_str())
        .unwrap()
        .to_string();

    // Email-borne flow: a browser gets the HTML confirmation page.
    let response = client
        .post(format!(
            "{}/approvals/{}/respond?token={}&action=approve",
            base, execution_id, token
        ))
        .header("accept", "text/html")
        .json(&json!({"comment": "looks good"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let html = response.text().await.unwrap();
    assert!(html.contains("Approved"));
    assert!(html.contains(&format!("<code>{}</code>", execution_id)));

    let body = wait_for_execution_status(&client, &base, &execution_id, "completed").await;
    assert_eq!(body["execution"]["variables"]["HT"]["approved"], true);
    assert_eq!(
        body["execution"]["variables"]["HT"]["comment"],
        "looks good"
    );

    // The consumed ticket rejects a second response.
    let replay = client
        .post(format!(
            "{}/approvals/{}/respond?token={}&action=reject",
            base, execution_id, token
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), 409);
}

#[tokio::test]
async fn rejection_fails_the_execution_over_http() {
    let base = spawn_app(10_000).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/workflows", base))
        .header("x-user-id", "alice")
        .json(&approval_workflow_body("reject-me"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workflow_id = created["id"].as_str().unwrap();

    let accepted: Value = client
        .post(format!("{}/workflows/{}/execute", base, workflow_id))
        .json(&json!({"trigger_data": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let execution_id = accepted["execution_id"].as_str().unwrap().to_string();

    let body = wait_for_execution_status(&client, &base, &execution_id, "paused").await;
    let token = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["kind"] == "human_approval_requested")
        .and_then(|e| e["payload"]["token"].as_str())
        .unwrap()
        .to_string();

    let ack: Value = client
        .post(format!(
            "{}/approvals/{}/respond?token={}&action=reject",
            base, execution_id, token
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ack["status"], "rejected");

    let body = wait_for_execution_status(&client, &base, &execution_id, "failed").await;
    assert_eq!(body["execution"]["error"], "rejected");
    assert!(body["execution"]["variables"].get("P").is_none());
}

#[tokio::test]
async fn webhook_requires_a_valid_signature() {
    let base = spawn_app(10_000).await;
    let client = reqwest::Client::new();

    let mut body = simple_workflow_body("hooked");
    body["nodes"][0]["config"] = json!({"secret": "shared-secret"});
    let created: Value = client
        .post(format!("{}/workflows", base))
        .header("x-user-id", "alice")
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workflow_id = created["id"].as_str().unwrap();

    let payload =
        serde_json::to_vec(&json!({"workflow_id": workflow_id, "data": {"from": "hook"}}))
            .unwrap();

    // Unsigned requests are rejected.
    let unsigned = client
        .post(format!("{}/webhooks/workflow-trigger", base))
        .header("content-type", "application/json")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(unsigned.status(), 401);

    let mut mac = Hmac::<Sha256>::new_from_slice(b"shared-secret").unwrap();
    mac.update(&payload);
    let signature = hex::encode(mac.finalize().into_bytes());

    let signed = client
        .post(format!("{}/webhooks/workflow-trigger", base))
        .header("content-type", "application/json")
        .header("x-webhook-signature", signature)
        .body(payload)
        .send()
        .await
        .unwrap();
    assert_eq!(signed.status(), 200);
    let ack: Value = signed.json().await.unwrap();
    let execution_id = ack["execution_id"].as_str().unwrap().to_string();

    let body = wait_for_execution_status(&client, &base, &execution_id, "completed").await;
    assert_eq!(body["execution"]["variables"]["input"]["from"], "hook");
}

#[tokio::test]
async fn rate_limit_headers_and_429() {
    let base = spawn_app(3).await;
    let client = reqwest::Client::new();

    for i in 1..=3 {
        let response = client
            .get(format!("{}/health", base))
            .header("x-user-id", "burst")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "request {} should pass", i);
        assert!(response.headers().contains_key("x-ratelimit-limit"));
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
        assert!(response.headers().contains_key("x-ratelimit-reset"));
    }

    let limited = client
        .get(format!("{}/health", base))
        .header("x-user-id", "burst")
        .send()
        .await
        .unwrap();
    assert_eq!(limited.status(), 429);
    assert_eq!(
        limited
            .headers()
            .get("x-ratelimit-remaining")
            .unwrap()
            .to_str()
            .unwrap(),
        "0"
    );
    let retry_after: u64 = limited
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0);

    // A different client is unaffected.
    let other = client
        .get(format!("{}/health", base))
        .header("x-user-id", "calm")
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), 200);
}

#[tokio::test]
async fn workflow_stats_aggregate_execution_history() {
    let base = spawn_app(10_000).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/workflows", base))
        .header("x-user-id", "alice")
        .json(&simple_workflow_body("counted"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workflow_id = created["id"].as_str().unwrap();

    for _ in 0..3 {
        let accepted: Value = client
            .post(format!("{}/workflows/{}/execute", base, workflow_id))
            .json(&json!({"trigger_data": {}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let execution_id = accepted["execution_id"].as_str().unwrap().to_string();
        wait_for_execution_status(&client, &base, &execution_id, "completed").await;
    }

    let response = client
        .get(format!("{}/workflows/{}/stats", base, workflow_id))
        .header("x-user-id", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["stats"]["total_executions"], 3);
    assert_eq!(body["stats"]["completed"], 3);
    assert!(body["stats"]["avg_duration_ms"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn missing_resources_use_the_error_envelope() {
    let base = spawn_app(10_000).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "{}/executions/00000000-0000-0000-0000-000000000000",
            base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let envelope: Value = response.json().await.unwrap();
    assert_eq!(envelope["error"], "not_found");
    assert_eq!(envelope["code"], 404);
    assert!(envelope["message"].as_str().is_some());
    assert!(envelope["timestamp"].as_str().is_some());
}

#[tokio::test]
async fn sse_stream_replays_the_event_log() {
    let base = spawn_app(10_000).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/workflows", base))
        .header("x-user-id", "alice")
        .json(&simple_workflow_body("streamed"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workflow_id = created["id"].as_str().unwrap();

    let accepted: Value = client
        .post(format!("{}/workflows/{}/execute", base, workflow_id))
        .json(&json!({"trigger_data": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let execution_id = accepted["execution_id"].as_str().unwrap().to_string();
    wait_for_execution_status(&client, &base, &execution_id, "completed").await;

    // A late subscriber sees the whole history replayed.
    let mut response = client
        .get(format!("{}/executions/{}/events", base, execution_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !collected.contains("workflow_completed") {
        let chunk = tokio::time::timeout_at(deadline, response.chunk())
            .await
            .expect("timed out waiting for SSE data")
            .unwrap();
        match chunk {
            Some(bytes) => collected.push_str(&String::from_utf8_lossy(&bytes)),
            None => break,
        }
    }
    assert!(collected.contains("workflow_started"));
    assert!(collected.contains("workflow_completed"));
    assert!(collected.lines().any(|line| line.starts_with("data:")));
}
