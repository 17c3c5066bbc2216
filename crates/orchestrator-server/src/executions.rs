use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use event_bus::EventFilter;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use state_store::ExecutionProgress;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

/// Polling read: the execution document, its event log, and derived
/// progress counters.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let execution = state.store.get_execution(id).await?;
    let events = state.store.list_events(id).await?;
    let total_nodes = match state.store.get_workflow(execution.workflow_id).await {
        Ok(workflow) => workflow.nodes.len(),
        // The workflow may have been deleted from under old executions.
        Err(_) => execution.completed_nodes.len(),
    };
    let progress = ExecutionProgress::derive(&execution, total_nodes);
    Ok(Json(json!({
        "execution": execution,
        "events": events,
        "progress": progress,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeBody {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.pause(id).await?;
    Ok(Json(json!({"execution_id": id, "status": "paused"})))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ResumeBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let data = body.and_then(|Json(body)| body.data);
    state.engine.resume(id, data).await?;
    Ok(Json(json!({"execution_id": id, "status": "running"})))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.cancel(id).await?;
    Ok(Json(json!({"execution_id": id, "status": "cancelled"})))
}

/// Server-Sent-Event stream: replays the stored log, then forwards live
/// bus events in the same per-execution order.
pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    // 404 for unknown executions rather than an empty stream.
    state.store.get_execution(id).await?;

    let subscription = state.bus.subscribe(EventFilter::for_execution(id));
    let stored = state.store.list_events(id).await?;
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<SseEvent, Infallible>>(64);

    tokio::spawn(async move {
        let mut last_sequence = 0;
        for event in stored {
            last_sequence = event.sequence;
            if tx.send(Ok(to_sse(&event))).await.is_err() {
                return;
            }
        }
        while let Some(event) = subscription.recv().await {
            // The replay already covered everything up to last_sequence.
            if event.sequence <= last_sequence {
                continue;
            }
            if tx.send(Ok(to_sse(&event))).await.is_err() {
                debug!(execution_id = %id, "SSE client disconnected");
                return;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::new()))
}

fn to_sse(event: &event_bus::Event) -> SseEvent {
    SseEvent::default().data(serde_json::to_string(event).unwrap_or_default())
}
