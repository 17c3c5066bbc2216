//! Approval Pipeline Demo
//!
//! Runs a three-node workflow (trigger -> human task -> output) against
//! the in-memory store, approves the suspended task programmatically and
//! prints the event log.

use ai_router::{AiRouter, RouterConfig};
use coordination_service::{LockManager, RateLimiter};
use event_bus::EventBus;
use serde_json::json;
use state_store::{
    ApprovalFallback, DataConfig, Edge, ExecutionStatus, HumanTaskConfig, MemoryStore, Node,
    NodeKind, StateStore, TriggerConfig, Workflow, WorkflowStatus,
};
use std::sync::Arc;
use std::time::Duration;
use workflow_engine::{
    ApprovalAction, ApprovalService, EngineConfig, LoggedEventSink, Notifier, WorkflowEngine,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::default();
    let sink = Arc::new(LoggedEventSink::new(store.clone(), bus.clone()));
    let router = Arc::new(AiRouter::new(
        RouterConfig::from_env(),
        Arc::new(RateLimiter::new()),
        sink.clone(),
    ));
    let approvals = Arc::new(ApprovalService::new(b"demo-secret".to_vec(), sink));

    let engine = WorkflowEngine::new(
        store.clone(),
        bus,
        Arc::new(LockManager::new()),
        router,
        approvals.clone(),
        Notifier::disabled(),
        EngineConfig::default(),
    );
    engine.start();

    let workflow = build_workflow();
    let workflow = store.create_workflow(workflow).await?;
    println!("Created workflow {} ({})", workflow.name, workflow.id);

    let execution_id = engine
        .execute(workflow.id, json!({"document": "Q3 budget proposal"}), true)
        .await?;
    println!("Execution {} started", execution_id);

    // Wait until the human task suspends the execution.
    loop {
        let execution = store.get_execution(execution_id).await?;
        if execution.status == ExecutionStatus::Paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let ticket = approvals
        .open_ticket(execution_id, "review")
        .expect("ticket should be open");
    println!("Approval requested for {} (token {})", ticket.assignee, ticket.token);

    engine
        .respond_approval(
            &ticket.token,
            ApprovalAction::Approve,
            json!({"comment": "ship it"}),
        )
        .await?;

    loop {
        let execution = store.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            println!("Execution finished: {}", execution.status.as_str());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    println!("Event log:");
    for event in store.list_events(execution_id).await? {
        println!("  {:>2}. {}", event.sequence, event.kind.as_str());
    }
    Ok(())
}

fn build_workflow() -> Workflow {
    let nodes = vec![
        Node {
            id: "start".to_string(),
            kind: NodeKind::Trigger(TriggerConfig::default()),
            position: serde_json::Value::Null,
        },
        Node {
            id: "review".to_string(),
            kind: NodeKind::HumanTask(HumanTaskConfig {
                assignee: "reviewer@example.com".to_string(),
                secondary_assignee: None,
                timeout_ms: Some(60_000),
                fallback: ApprovalFallback::Cancel,
                message: Some("Please review the attached document".to_string()),
            }),
            position: serde_json::Value::Null,
        },
        Node {
            id: "publish".to_string(),
            kind: NodeKind::DataOutput(DataConfig::default()),
            position: serde_json::Value::Null,
        },
    ];
    let edges = vec![
        Edge::new("e1", "start", "review"),
        Edge::new("e2", "review", "publish"),
    ];
    let mut workflow = Workflow::new("document-approval".to_string(), nodes, edges);
    workflow.status = WorkflowStatus::Active;
    workflow.metadata.creator = "demo".to_string();
    workflow
}
