use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle event kinds emitted during workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    AiRequest,
    AiResponse,
    HumanApprovalRequested,
    HumanApproved,
    HumanRejected,
    ApprovalTimeout,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::WorkflowFailed => "workflow_failed",
            EventKind::NodeStarted => "node_started",
            EventKind::NodeCompleted => "node_completed",
            EventKind::NodeFailed => "node_failed",
            EventKind::AiRequest => "ai_request",
            EventKind::AiResponse => "ai_response",
            EventKind::HumanApprovalRequested => "human_approval_requested",
            EventKind::HumanApproved => "human_approved",
            EventKind::HumanRejected => "human_rejected",
            EventKind::ApprovalTimeout => "approval_timeout",
        }
    }
}

/// A single immutable record of a lifecycle transition.
///
/// The same shape is appended to the event log and broadcast on the bus;
/// `sequence` is assigned by the log so both channels observe the same
/// per-execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl Event {
    pub fn new(
        execution_id: Uuid,
        node_id: Option<String>,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id,
            kind,
            payload,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }
}

/// Subscriber-side filter. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<EventKind>>,
}

impl EventFilter {
    pub fn for_execution(execution_id: Uuid) -> Self {
        Self {
            execution_id: Some(execution_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(execution_id) = self.execution_id {
            if event.execution_id != execution_id {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if event.node_id.as_deref() != Some(node_id.as_str()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_serializes_snake_case() {
        let s = serde_json::to_string(&EventKind::HumanApprovalRequested).unwrap();
        assert_eq!(s, "\"human_approval_requested\"");
    }

    #[test]
    fn filter_matches_on_execution_and_kind() {
        let execution_id = Uuid::new_v4();
        let event = Event::new(
            execution_id,
            Some("summarize".to_string()),
            EventKind::NodeCompleted,
            json!({"ok": true}),
        );

        assert!(EventFilter::default().matches(&event));
        assert!(EventFilter::for_execution(execution_id).matches(&event));
        assert!(!EventFilter::for_execution(Uuid::new_v4()).matches(&event));

        let filter = EventFilter {
            execution_id: Some(execution_id),
            node_id: Some("other".to_string()),
            kinds: None,
        };
        assert!(!filter.matches(&event));

        let filter = EventFilter {
            kinds: Some(vec![EventKind::NodeStarted, EventKind::NodeCompleted]),
            ..Default::default()
        };
        assert!(filter.matches(&event));
    }
}
