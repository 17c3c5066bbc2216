use crate::execution::{Execution, ExecutionStatus, NodeHistoryEntry};
use crate::store::{StateStore, WorkflowListFilter, WorkflowStats};
use crate::workflow::{Workflow, WorkflowStatus};
use crate::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use event_bus::Event;
use tracing::debug;
use uuid::Uuid;

/// In-process document store.
///
/// One map per collection, mirroring the persisted layout a durable
/// backend would use: `workflows` keyed by id (listed by status/updated_at
/// and permission arrays), `executions` keyed by id (listed by
/// workflow_id/status), `event_log` keyed by execution id with
/// per-execution sequence order.
#[derive(Default)]
pub struct MemoryStore {
    workflows: DashMap<Uuid, Workflow>,
    executions: DashMap<Uuid, Execution>,
    event_log: DashMap<Uuid, Vec<Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow, StoreError> {
        debug!(workflow_id = %workflow.id, name = %workflow.name, "Creating workflow");
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        self.workflows
            .get(&id)
            .map(|w| w.clone())
            .ok_or_else(|| StoreError::NotFound(format!("workflow {}", id)))
    }

    async fn list_workflows(
        &self,
        principal: &str,
        filter: &WorkflowListFilter,
    ) -> Result<Vec<Workflow>, StoreError> {
        let mut matching: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|entry| entry.is_visible_to(principal))
            .filter(|entry| filter.status.map_or(true, |s| entry.status == s))
            .filter(|entry| {
                filter
                    .category
                    .as_deref()
                    .map_or(true, |c| entry.metadata.category.as_deref() == Some(c))
            })
            .filter(|entry| {
                filter.search.as_deref().map_or(true, |term| {
                    let term = term.to_lowercase();
                    entry.name.to_lowercase().contains(&term)
                        || entry.description.to_lowercase().contains(&term)
                })
            })
            .map(|entry| entry.clone())
            .collect();

        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let page = filter.page.max(1);
        let start = (page - 1) * filter.limit;
        Ok(matching.into_iter().skip(start).take(filter.limit).collect())
    }

    async fn update_workflow_if_version(
        &self,
        mut workflow: Workflow,
        expected_version: u64,
    ) -> Result<Workflow, StoreError> {
        let mut entry = self
            .workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| StoreError::NotFound(format!("workflow {}", workflow.id)))?;

        if entry.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: entry.version,
            });
        }

        workflow.version = entry.version + 1;
        workflow.created_at = entry.created_at;
        workflow.updated_at = Utc::now();
        *entry = workflow.clone();
        Ok(workflow)
    }

    async fn archive_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        let mut entry = self
            .workflows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("workflow {}", id)))?;
        entry.status = WorkflowStatus::Archived;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn create_execution(&self, execution: Execution) -> Result<(), StoreError> {
        debug!(execution_id = %execution.id, workflow_id = %execution.workflow_id, "Creating execution");
        self.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.executions
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", id)))
    }

    async fn put_execution(&self, execution: Execution) -> Result<(), StoreError> {
        if !self.executions.contains_key(&execution.id) {
            return Err(StoreError::NotFound(format!("execution {}", execution.id)));
        }
        self.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn set_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<Execution, StoreError> {
        let mut entry = self
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", id)))?;

        if entry.status != status && !entry.status.can_transition_to(status) {
            return Err(StoreError::Fatal(format!(
                "invalid status transition {} -> {} for execution {}",
                entry.status.as_str(),
                status.as_str(),
                id
            )));
        }

        entry.status = status;
        if let Some(error) = error {
            entry.error = Some(error);
        }
        if status.is_terminal() {
            entry.completed_at = Some(Utc::now());
        }
        Ok(entry.clone())
    }

    async fn append_history(&self, id: Uuid, entry: NodeHistoryEntry) -> Result<(), StoreError> {
        let mut execution = self
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", id)))?;
        execution.node_history.push(entry);
        Ok(())
    }

    async fn set_current_node(&self, id: Uuid, node_id: Option<String>) -> Result<(), StoreError> {
        let mut execution = self
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", id)))?;
        execution.current_node_id = node_id;
        Ok(())
    }

    async fn merge_variables(
        &self,
        id: Uuid,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut execution = self
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", id)))?;
        for (key, value) in patch {
            execution.variables.insert(key, value);
        }
        Ok(())
    }

    async fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<Execution>, StoreError> {
        Ok(self
            .executions
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.clone())
            .collect())
    }

    async fn append_event(&self, mut event: Event) -> Result<Event, StoreError> {
        let mut log = self.event_log.entry(event.execution_id).or_default();
        event.sequence = log.len() as u64 + 1;
        log.push(event.clone());
        Ok(event)
    }

    async fn list_events(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .event_log
            .get(&execution_id)
            .map(|log| log.clone())
            .unwrap_or_default())
    }

    async fn stats_by_workflow(&self, workflow_id: Uuid) -> Result<WorkflowStats, StoreError> {
        let mut stats = WorkflowStats::default();
        let mut total_duration_ms = 0u64;
        let mut finished = 0u64;

        for execution in self.executions.iter() {
            if execution.workflow_id != workflow_id {
                continue;
            }
            stats.total_executions += 1;
            match execution.status {
                ExecutionStatus::Completed => stats.completed += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Cancelled => stats.cancelled += 1,
                ExecutionStatus::Running | ExecutionStatus::Paused | ExecutionStatus::Pending => {
                    stats.running += 1
                }
            }
            if let Some(completed_at) = execution.completed_at {
                let duration = completed_at - execution.started_at;
                total_duration_ms += duration.num_milliseconds().max(0) as u64;
                finished += 1;
            }
            for entry in &execution.node_history {
                stats.total_ai_tokens += entry.metrics.ai_tokens_used as u64;
                stats.total_ai_cost += entry.metrics.ai_cost;
            }
        }

        if finished > 0 {
            stats.avg_duration_ms = total_duration_ms as f64 / finished as f64;
        }
        Ok(stats)
    }
}
