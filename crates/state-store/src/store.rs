use crate::execution::{Execution, ExecutionStatus, NodeHistoryEntry};
use crate::workflow::{Workflow, WorkflowStatus};
use crate::StoreError;
use async_trait::async_trait;
use event_bus::Event;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Paging and filtering for workflow listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowListFilter {
    pub page: usize,
    pub limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Default for WorkflowListFilter {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            status: None,
            category: None,
            search: None,
        }
    }
}

/// Aggregated execution history for one workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub total_executions: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub running: u64,
    pub avg_duration_ms: f64,
    pub total_ai_tokens: u64,
    pub total_ai_cost: f64,
}

/// Typed CRUD over workflows, executions and the event log.
///
/// Mutating execution helpers are atomic on the execution document; the
/// engine performs read-modify-write sequences under the per-execution
/// distributed lock, so document-level last-writer-wins is sufficient.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Workflows
    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow, StoreError>;
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError>;
    async fn list_workflows(
        &self,
        principal: &str,
        filter: &WorkflowListFilter,
    ) -> Result<Vec<Workflow>, StoreError>;
    /// Saves `workflow` only when the stored version equals
    /// `expected_version`, bumping the version. Returns the saved document.
    async fn update_workflow_if_version(
        &self,
        workflow: Workflow,
        expected_version: u64,
    ) -> Result<Workflow, StoreError>;
    async fn archive_workflow(&self, id: Uuid) -> Result<(), StoreError>;

    // Executions
    async fn create_execution(&self, execution: Execution) -> Result<(), StoreError>;
    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError>;
    /// Full-document write; callers must hold the execution lock.
    async fn put_execution(&self, execution: Execution) -> Result<(), StoreError>;
    /// Transitions the status, recording `error` and stamping
    /// `completed_at` for terminal states. Rejects transitions the state
    /// machine forbids.
    async fn set_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<Execution, StoreError>;
    async fn append_history(&self, id: Uuid, entry: NodeHistoryEntry) -> Result<(), StoreError>;
    async fn set_current_node(&self, id: Uuid, node_id: Option<String>) -> Result<(), StoreError>;
    /// Merges `patch` into the execution's variables map.
    async fn merge_variables(
        &self,
        id: Uuid,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError>;
    async fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<Execution>, StoreError>;

    // Event log
    /// Appends the event, stamping its per-execution sequence number.
    async fn append_event(&self, event: Event) -> Result<Event, StoreError>;
    async fn list_events(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError>;

    // History
    async fn stats_by_workflow(&self, workflow_id: Uuid) -> Result<WorkflowStats, StoreError>;
}
