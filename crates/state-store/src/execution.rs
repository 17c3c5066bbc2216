use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// A single traversal of a workflow snapshot.
///
/// Mutated only by the worker holding the execution's distributed lock;
/// the store provides last-writer-wins at the document level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u64,
    pub status: ExecutionStatus,
    /// Set while the execution is paused on a suspended node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    /// Node outputs keyed by node id, plus the trigger payload under `input`.
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub node_history: Vec<NodeHistoryEntry>,
    /// Nodes scheduled or running; used for join tracking and completion
    /// detection.
    #[serde(default)]
    pub in_flight: HashSet<String>,
    /// Nodes that completed successfully.
    #[serde(default)]
    pub completed_nodes: HashSet<String>,
    /// Join-ready nodes parked because the workflow's concurrency budget
    /// was exhausted; drained as in-flight nodes finish.
    #[serde(default)]
    pub pending: Vec<String>,
}

impl Execution {
    pub fn new(workflow_id: Uuid, workflow_version: u64, input: serde_json::Value) -> Self {
        let mut variables = serde_json::Map::new();
        variables.insert("input".to_string(), input);
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            workflow_version,
            status: ExecutionStatus::Running,
            current_node_id: None,
            variables,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            node_history: Vec::new(),
            in_flight: HashSet::new(),
            completed_nodes: HashSet::new(),
            pending: Vec::new(),
        }
    }
}

/// Execution lifecycle states.
///
/// ```text
/// pending -> running <-> paused
///               |-> completed | failed | cancelled (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether the state machine permits `self -> next`. Terminal states
    /// admit nothing; any non-terminal state may be cancelled.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, ExecutionStatus::Cancelled) => true,
            (ExecutionStatus::Pending, ExecutionStatus::Running) => true,
            (ExecutionStatus::Running, ExecutionStatus::Paused) => true,
            (ExecutionStatus::Paused, ExecutionStatus::Running) => true,
            (ExecutionStatus::Running, ExecutionStatus::Completed) => true,
            (ExecutionStatus::Running, ExecutionStatus::Failed) => true,
            (ExecutionStatus::Paused, ExecutionStatus::Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one node attempt, closed when the attempt ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHistoryEntry {
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: NodeRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: NodeMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub duration_ms: u64,
    pub ai_tokens_used: u32,
    pub ai_cost: f64,
    pub memory_peak: u64,
}

/// Derived progress counters returned by the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
}

impl ExecutionProgress {
    pub fn derive(execution: &Execution, total_nodes: usize) -> Self {
        let failed_nodes = execution
            .node_history
            .iter()
            .filter(|h| h.status == NodeRunStatus::Failed)
            .map(|h| h.node_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        Self {
            total_nodes,
            completed_nodes: execution.completed_nodes.len(),
            failed_nodes,
            current_node_id: execution.current_node_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_nothing() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            for next in [
                ExecutionStatus::Running,
                ExecutionStatus::Paused,
                ExecutionStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn any_non_terminal_state_can_cancel() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
        ] {
            assert!(status.can_transition_to(ExecutionStatus::Cancelled));
        }
    }

    #[test]
    fn running_and_paused_alternate() {
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Paused));
        assert!(ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Running));
        assert!(!ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Completed));
    }

    #[test]
    fn new_execution_carries_trigger_payload() {
        let execution = Execution::new(Uuid::new_v4(), 1, serde_json::json!({"count": 5}));
        assert_eq!(execution.variables["input"]["count"], 5);
        assert_eq!(execution.status, ExecutionStatus::Running);
    }
}
