use crate::auth::Principal;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use event_bus::{EventFilter, EventKind};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<Uuid>,
}

pub async fn upgrade(
    State(state): State<AppState>,
    principal: Principal,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, principal, socket))
}

/// Per-client bridge: `subscribe:execution {id}` / `subscribe:workflow
/// {id}` register filtered bus subscriptions whose events are forwarded
/// as `{type, data, timestamp}` frames until unsubscribe or close.
async fn handle_socket(state: AppState, principal: Principal, mut socket: WebSocket) {
    debug!(principal = %principal.0, "WebSocket client connected");
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(ack) = handle_command(&state, &text, &tx, &mut forwarders) {
                            if socket.send(Message::Text(ack)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    for (_, forwarder) in forwarders {
        forwarder.abort();
    }
    debug!(principal = %principal.0, "WebSocket client disconnected");
}

fn handle_command(
    state: &AppState,
    text: &str,
    tx: &mpsc::Sender<String>,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
) -> Option<String> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            return Some(
                json!({"type": "error", "data": {"message": format!("bad message: {}", e)}, "timestamp": Utc::now()})
                    .to_string(),
            )
        }
    };

    match (message.kind.as_str(), message.id) {
        ("subscribe:execution", Some(id)) => {
            let key = format!("execution:{}", id);
            let subscription = state.bus.subscribe(EventFilter::for_execution(id));
            let tx = tx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    let frame = json!({
                        "type": event.kind.as_str(),
                        "data": event,
                        "timestamp": Utc::now(),
                    });
                    if tx.send(frame.to_string()).await.is_err() {
                        break;
                    }
                }
            });
            if let Some(old) = forwarders.insert(key.clone(), forwarder) {
                old.abort();
            }
            Some(ack("subscribed", &key))
        }
        ("subscribe:workflow", Some(id)) => {
            let key = format!("workflow:{}", id);
            // Events carry only the execution id, so watch for
            // workflow_started frames naming this workflow and follow the
            // executions they open.
            let subscription = state.bus.subscribe(EventFilter::default());
            let tx = tx.clone();
            let forwarder = tokio::spawn(async move {
                let mut watched: HashSet<Uuid> = HashSet::new();
                while let Some(event) = subscription.recv().await {
                    if event.kind == EventKind::WorkflowStarted
                        && event.payload["workflow_id"] == json!(id)
                    {
                        watched.insert(event.execution_id);
                    }
                    if !watched.contains(&event.execution_id) {
                        continue;
                    }
                    let frame = json!({
                        "type": event.kind.as_str(),
                        "data": event,
                        "timestamp": Utc::now(),
                    });
                    if tx.send(frame.to_string()).await.is_err() {
                        break;
                    }
                }
            });
            if let Some(old) = forwarders.insert(key.clone(), forwarder) {
                old.abort();
            }
            Some(ack("subscribed", &key))
        }
        ("unsubscribe", Some(id)) => {
            for key in [format!("execution:{}", id), format!("workflow:{}", id)] {
                if let Some(forwarder) = forwarders.remove(&key) {
                    forwarder.abort();
                    return Some(ack("unsubscribed", &key));
                }
            }
            Some(ack("unsubscribed", "none"))
        }
        _ => Some(
            json!({"type": "error", "data": {"message": "unknown message type"}, "timestamp": Utc::now()})
                .to_string(),
        ),
    }
}

fn ack(kind: &str, scope: &str) -> String {
    json!({"type": kind, "data": {"scope": scope}, "timestamp": Utc::now()}).to_string()
}
