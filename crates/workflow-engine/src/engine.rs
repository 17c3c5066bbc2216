//! Execution engine
//!
//! Owns the worker pool and the execution lifecycle. Every node
//! advancement happens under the execution's distributed lock: re-read,
//! run the executor, persist variables and history, emit events, fan out
//! to successor nodes. Human-task resumptions take priority over fresh
//! node starts.

use crate::approvals::{ApprovalAction, ApprovalOutcome, ApprovalService, ApprovalTicket};
use crate::executors::{node_timeout, ExecutorError, ExecutorOutcome, NodeExecutor, Suspension};
use crate::expression;
use crate::notify::Notifier;
use crate::validate::validate_workflow;
use crate::EngineError;
use ai_router::AiRouter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coordination_service::{LockManager, LockToken};
use event_bus::{Event, EventBus, EventKind, EventSink};
use parking_lot::Mutex;
use serde_json::{json, Value};
use state_store::{
    ApprovalFallback, EdgeType, Execution, ExecutionStatus, HumanTaskConfig, Node,
    NodeHistoryEntry, NodeKind, NodeMetrics, NodeRunStatus, StateStore, Workflow, WorkflowStatus,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker tasks consuming the node queue.
    pub worker_count: usize,
    /// Node timeout when the node config sets none.
    pub default_node_timeout: Duration,
    /// Minimum TTL on the per-execution lock.
    pub lock_ttl_floor: Duration,
    /// Delay before retrying a failed lock acquisition.
    pub lock_retry_delay: Duration,
    /// Base delay for node retry backoff, doubled per attempt.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_count: cores * 4,
            default_node_timeout: Duration::from_secs(60),
            lock_ttl_floor: Duration::from_secs(60),
            lock_retry_delay: Duration::from_millis(100),
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

/// Event sink that appends to the durable log before fanning out on the
/// bus, so both channels observe the same per-execution order.
pub struct LoggedEventSink {
    store: Arc<dyn StateStore>,
    bus: EventBus,
}

impl LoggedEventSink {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }
}

#[async_trait]
impl EventSink for LoggedEventSink {
    async fn publish(&self, event: Event) -> Event {
        match self.store.append_event(event.clone()).await {
            Ok(stamped) => {
                self.bus.emit(stamped.clone());
                stamped
            }
            Err(e) => {
                // The bus still delivers; the log entry is lost.
                warn!(error = %e, "Failed to append event to the log");
                self.bus.emit(event.clone());
                event
            }
        }
    }
}

#[derive(Debug, Clone)]
enum ResumeAction {
    Approval { approved: bool, payload: Value },
    Timer,
}

/// Outcome of the claim phase of node advancement.
enum Prepared {
    /// Node is claimed and `node_started` is emitted; run the executor.
    Run {
        workflow: Workflow,
        execution: Execution,
    },
    /// Resumption handled, execution not running, or terminally failed.
    Done,
}

#[derive(Debug, Clone)]
struct WorkItem {
    execution_id: Uuid,
    node_id: String,
    attempt: u32,
    resume: Option<ResumeAction>,
}

/// FIFO queues with resumption priority: items re-entering a suspended
/// execution preempt fresh node starts.
struct WorkQueue {
    resume: Mutex<VecDeque<WorkItem>>,
    fresh: Mutex<VecDeque<WorkItem>>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            resume: Mutex::new(VecDeque::new()),
            fresh: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn push_fresh(&self, item: WorkItem) {
        self.fresh.lock().push_back(item);
        self.notify.notify_one();
    }

    fn push_resume(&self, item: WorkItem) {
        self.resume.lock().push_back(item);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<WorkItem> {
        if let Some(item) = self.resume.lock().pop_front() {
            return Some(item);
        }
        self.fresh.lock().pop_front()
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    locks: Arc<LockManager>,
    executor: NodeExecutor,
    approvals: Arc<ApprovalService>,
    notifier: Notifier,
    config: EngineConfig,
    queue: Arc<WorkQueue>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: EventBus,
        locks: Arc<LockManager>,
        router: Arc<AiRouter>,
        approvals: Arc<ApprovalService>,
        notifier: Notifier,
        config: EngineConfig,
    ) -> Self {
        let executor = NodeExecutor::new(router, approvals.clone());
        Self {
            store,
            bus,
            locks,
            executor,
            approvals,
            notifier,
            config,
            queue: Arc::new(WorkQueue::new()),
        }
    }

    /// Spawn the worker pool.
    pub fn start(&self) {
        for worker in 0..self.config.worker_count {
            let engine = self.clone();
            tokio::spawn(async move {
                loop {
                    if engine.queue.is_shut_down() {
                        break;
                    }
                    match engine.queue.pop() {
                        Some(item) => {
                            let execution_id = item.execution_id;
                            let node_id = item.node_id.clone();
                            if let Err(e) = engine.advance(item).await {
                                error!(
                                    worker,
                                    execution_id = %execution_id,
                                    node_id = %node_id,
                                    error = %e,
                                    "Node advancement failed"
                                );
                            }
                        }
                        None => engine.queue.notify.notified().await,
                    }
                }
            });
        }
        info!(workers = self.config.worker_count, "Workflow engine started");
    }

    pub fn shutdown(&self) {
        self.queue.shut_down();
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn approvals(&self) -> &Arc<ApprovalService> {
        &self.approvals
    }

    /// Open an execution for `workflow_id` and schedule its entry node.
    /// Returns immediately; callers observe progress via events or status
    /// queries. A draft workflow may run only when triggered manually.
    pub async fn execute(
        &self,
        workflow_id: Uuid,
        trigger_payload: Value,
        manual: bool,
    ) -> Result<Uuid, EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        match workflow.status {
            WorkflowStatus::Active => {}
            WorkflowStatus::Draft if manual => {}
            WorkflowStatus::Draft => {
                return Err(EngineError::Validation(
                    "workflow is a draft; only manual triggers may run it".to_string(),
                ))
            }
            WorkflowStatus::Archived => {
                return Err(EngineError::Validation("workflow is archived".to_string()))
            }
        }
        validate_workflow(&workflow)?;

        let entry = workflow
            .entry_node()
            .ok_or_else(|| EngineError::Validation("workflow has no nodes".to_string()))?
            .id
            .clone();

        let mut execution = Execution::new(workflow.id, workflow.version, trigger_payload);
        execution.in_flight.insert(entry.clone());
        let execution_id = execution.id;
        self.store.create_execution(execution).await?;

        self.publish(Event::new(
            execution_id,
            None,
            EventKind::WorkflowStarted,
            json!({"workflow_id": workflow.id, "workflow_name": workflow.name}),
        ))
        .await?;

        self.queue.push_fresh(WorkItem {
            execution_id,
            node_id: entry,
            attempt: 0,
            resume: None,
        });
        info!(
            workflow_id = %workflow.id,
            execution_id = %execution_id,
            "Execution started"
        );
        Ok(execution_id)
    }

    /// Cancel a non-terminal execution. In-flight node completions that
    /// land afterwards see the terminal status and drop their output.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let (key, token) = self
            .acquire_execution_lock(execution_id, self.config.lock_ttl_floor)
            .await?;
        let result = self.cancel_locked(execution_id).await;
        self.locks.release(&key, token).await;
        result
    }

    async fn cancel_locked(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "execution is already {}",
                execution.status.as_str()
            )));
        }
        self.store
            .set_execution_status(execution_id, ExecutionStatus::Cancelled, None)
            .await?;
        self.publish(Event::new(
            execution_id,
            None,
            EventKind::WorkflowFailed,
            json!({"reason": "cancelled"}),
        ))
        .await?;
        info!(execution_id = %execution_id, "Execution cancelled");
        Ok(())
    }

    /// Manually pause a running execution; scheduled nodes check the
    /// status before running and stay in the in-flight set for resume.
    pub async fn pause(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let (key, token) = self
            .acquire_execution_lock(execution_id, self.config.lock_ttl_floor)
            .await?;
        let result = async {
            let execution = self.store.get_execution(execution_id).await?;
            if execution.status != ExecutionStatus::Running {
                return Err(EngineError::InvalidState(format!(
                    "cannot pause a {} execution",
                    execution.status.as_str()
                )));
            }
            self.store
                .set_execution_status(execution_id, ExecutionStatus::Paused, None)
                .await?;
            info!(execution_id = %execution_id, "Execution paused");
            Ok(())
        }
        .await;
        self.locks.release(&key, token).await;
        result
    }

    /// Resume a paused execution. `data` merges into the variables; the
    /// resume frontier is the suspended node when one is recorded,
    /// otherwise the in-flight set from a manual pause.
    pub async fn resume(
        &self,
        execution_id: Uuid,
        data: Option<Value>,
    ) -> Result<(), EngineError> {
        let (key, token) = self
            .acquire_execution_lock(execution_id, self.config.lock_ttl_floor)
            .await?;
        let result = self.resume_locked(execution_id, data).await;
        self.locks.release(&key, token).await;
        result
    }

    async fn resume_locked(
        &self,
        execution_id: Uuid,
        data: Option<Value>,
    ) -> Result<(), EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Paused {
            return Err(EngineError::InvalidState(format!(
                "cannot resume a {} execution",
                execution.status.as_str()
            )));
        }

        if let Some(Value::Object(patch)) = &data {
            self.store
                .merge_variables(execution_id, patch.clone())
                .await?;
        }

        match &execution.current_node_id {
            Some(node_id) => {
                // Suspended on a human task or timer; the resume item
                // performs the paused -> running transition itself.
                let workflow = self.store.get_workflow(execution.workflow_id).await?;
                let resume = match workflow.node(node_id).map(|n| &n.kind) {
                    Some(NodeKind::HumanTask(_)) => ResumeAction::Approval {
                        approved: true,
                        payload: data.unwrap_or(Value::Null),
                    },
                    _ => ResumeAction::Timer,
                };
                self.queue.push_resume(WorkItem {
                    execution_id,
                    node_id: node_id.clone(),
                    attempt: 0,
                    resume: Some(resume),
                });
            }
            None => {
                self.store
                    .set_execution_status(execution_id, ExecutionStatus::Running, None)
                    .await?;
                for node_id in &execution.in_flight {
                    self.queue.push_fresh(WorkItem {
                        execution_id,
                        node_id: node_id.clone(),
                        attempt: 0,
                        resume: None,
                    });
                }
            }
        }
        info!(execution_id = %execution_id, "Execution resumed");
        Ok(())
    }

    /// External approval callback entrypoint: verify and consume the
    /// ticket, then schedule the resumption with priority.
    pub async fn respond_approval(
        &self,
        token: &str,
        action: ApprovalAction,
        payload: Value,
    ) -> Result<ApprovalOutcome, EngineError> {
        let outcome = self.approvals.respond(token, action, payload).await?;
        self.queue.push_resume(WorkItem {
            execution_id: outcome.execution_id,
            node_id: outcome.node_id.clone(),
            attempt: 0,
            resume: Some(ResumeAction::Approval {
                approved: outcome.approved,
                payload: outcome.payload.clone(),
            }),
        });
        Ok(outcome)
    }

    /// Restart recovery: executions still marked running whose lock has no
    /// live holder were orphaned by a crash. Paused executions survive
    /// restart unchanged.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let running = self
            .store
            .list_executions_by_status(ExecutionStatus::Running)
            .await?;
        let mut orphaned = 0;
        for execution in running {
            let key = format!("execution:{}", execution.id);
            let Some(token) = self.locks.acquire(&key, self.config.lock_ttl_floor).await else {
                continue;
            };
            warn!(execution_id = %execution.id, "Failing orphaned execution after restart");
            self.store
                .set_execution_status(
                    execution.id,
                    ExecutionStatus::Failed,
                    Some("worker_crashed".to_string()),
                )
                .await?;
            self.publish(Event::new(
                execution.id,
                None,
                EventKind::WorkflowFailed,
                json!({"reason": "worker_crashed"}),
            ))
            .await?;
            self.locks.release(&key, token).await;
            orphaned += 1;
        }
        Ok(orphaned)
    }

    async fn publish(&self, event: Event) -> Result<Event, EngineError> {
        let stamped = self.store.append_event(event).await?;
        self.bus.emit(stamped.clone());
        Ok(stamped)
    }

    async fn acquire_execution_lock(
        &self,
        execution_id: Uuid,
        ttl: Duration,
    ) -> Result<(String, LockToken), EngineError> {
        let key = format!("execution:{}", execution_id);
        for _ in 0..50 {
            if let Some(token) = self.locks.acquire(&key, ttl).await {
                return Ok((key, token));
            }
            tokio::time::sleep(self.config.lock_retry_delay).await;
        }
        Err(EngineError::Lock(key))
    }

    /// Advance one scheduled node. The lock is held while the execution
    /// record is read or written, never across the node's own work, so
    /// concurrent nodes of one execution run simultaneously and `cancel`
    /// is never blocked behind a slow HTTP or AI call.
    async fn advance(&self, item: WorkItem) -> Result<(), EngineError> {
        let key = format!("execution:{}", item.execution_id);

        // Phase 1: claim the node, validate status, emit node_started.
        let Some(token) = self.locks.acquire(&key, self.config.lock_ttl_floor).await else {
            // Another worker is mutating the execution; come back shortly.
            let delay = self.config.lock_retry_delay;
            if item.resume.is_some() {
                self.spawn_requeue_resume(item, delay);
            } else {
                self.spawn_requeue(item, delay);
            }
            return Ok(());
        };
        let prepared = self.prepare_node(&item).await;
        self.locks.release(&key, token).await;

        let (workflow, execution) = match prepared? {
            Prepared::Run { workflow, execution } => (workflow, execution),
            Prepared::Done => return Ok(()),
        };
        let Some(node) = workflow.node(&item.node_id) else {
            return Ok(());
        };

        // Phase 2: run the executor without the lock.
        let started_at = Utc::now();
        let timeout = node_timeout(node, self.config.default_node_timeout);
        let outcome = match tokio::time::timeout(timeout, self.executor.execute(&execution, node))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(ExecutorError::Retryable(format!(
                "node timed out after {:?}",
                timeout
            ))),
        };

        // Phase 3: settle the result under the lock; a terminal status
        // that landed meanwhile discards the result without further events.
        let (key, token) = self
            .acquire_execution_lock(item.execution_id, self.config.lock_ttl_floor)
            .await?;
        let result = self
            .settle_node(&workflow, &item, node, outcome, started_at)
            .await;
        self.locks.release(&key, token).await;
        result
    }

    async fn prepare_node(&self, item: &WorkItem) -> Result<Prepared, EngineError> {
        let execution = self.store.get_execution(item.execution_id).await?;
        let workflow = self.store.get_workflow(execution.workflow_id).await?;
        if workflow.version != execution.workflow_version {
            warn!(
                execution_id = %execution.id,
                execution_version = execution.workflow_version,
                workflow_version = workflow.version,
                "Workflow changed since the execution started"
            );
        }

        if let Some(action) = item.resume.clone() {
            self.handle_resume(&workflow, execution, item, action).await?;
            return Ok(Prepared::Done);
        }

        if execution.status != ExecutionStatus::Running {
            debug!(
                execution_id = %execution.id,
                node_id = %item.node_id,
                status = execution.status.as_str(),
                "Dropping scheduled node; execution is not running"
            );
            return Ok(Prepared::Done);
        }

        // Wall-clock bound over the whole execution.
        let elapsed_ms = (Utc::now() - execution.started_at).num_milliseconds().max(0) as u64;
        if elapsed_ms > workflow.settings.timeout_ms {
            self.fail_execution(&workflow, execution.id, "workflow timeout".to_string())
                .await?;
            return Ok(Prepared::Done);
        }

        let Some(node) = workflow.node(&item.node_id) else {
            self.fail_execution(
                &workflow,
                execution.id,
                format!("unknown node: {}", item.node_id),
            )
            .await?;
            return Ok(Prepared::Done);
        };

        self.publish(Event::new(
            execution.id,
            Some(node.id.clone()),
            EventKind::NodeStarted,
            json!({"kind": node.kind.name(), "attempt": item.attempt}),
        ))
        .await?;
        Ok(Prepared::Run {
            workflow,
            execution,
        })
    }

    async fn settle_node(
        &self,
        workflow: &Workflow,
        item: &WorkItem,
        node: &Node,
        outcome: Result<ExecutorOutcome, ExecutorError>,
        started_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let execution = self.store.get_execution(item.execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            debug!(
                execution_id = %execution.id,
                node_id = %node.id,
                status = execution.status.as_str(),
                "Discarding node result; execution left the running state"
            );
            return Ok(());
        }

        match outcome {
            Ok(ExecutorOutcome::Completed { output, mut metrics }) => {
                if metrics.duration_ms == 0 {
                    metrics.duration_ms =
                        (Utc::now() - started_at).num_milliseconds().max(0) as u64;
                }
                self.complete_node(workflow, execution, node, output, metrics, started_at)
                    .await
            }
            Ok(ExecutorOutcome::Suspended(Suspension::Approval { ticket })) => {
                self.suspend_execution(&execution, node).await?;
                if let NodeKind::HumanTask(config) = &node.kind {
                    self.schedule_approval_deadline(ticket, config.clone());
                }
                Ok(())
            }
            Ok(ExecutorOutcome::Suspended(Suspension::Timer { wake_at })) => {
                self.suspend_execution(&execution, node).await?;
                self.schedule_timer_wakeup(execution.id, node.id.clone(), wake_at);
                Ok(())
            }
            Err(error) => {
                self.handle_node_failure(workflow, execution, node, item.attempt, error, started_at)
                    .await
            }
        }
    }

    async fn suspend_execution(
        &self,
        execution: &Execution,
        node: &Node,
    ) -> Result<(), EngineError> {
        self.store
            .set_current_node(execution.id, Some(node.id.clone()))
            .await?;
        self.store
            .set_execution_status(execution.id, ExecutionStatus::Paused, None)
            .await?;
        info!(
            execution_id = %execution.id,
            node_id = %node.id,
            "Execution suspended"
        );
        Ok(())
    }

    /// Persist a successful node run, emit `node_completed`, and enqueue
    /// every traversable successor whose join is satisfied. Completes the
    /// workflow when nothing remains in flight.
    async fn complete_node(
        &self,
        workflow: &Workflow,
        mut execution: Execution,
        node: &Node,
        output: Value,
        metrics: NodeMetrics,
        started_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        execution
            .variables
            .insert(node.id.clone(), output.clone());
        execution.in_flight.remove(&node.id);
        execution.completed_nodes.insert(node.id.clone());
        execution.node_history.push(NodeHistoryEntry {
            node_id: node.id.clone(),
            started_at,
            ended_at: Utc::now(),
            status: NodeRunStatus::Success,
            output: Some(output),
            error: None,
            metrics: metrics.clone(),
        });

        // Parked nodes from earlier fan-outs go first, then this node's
        // traversable successors.
        let mut candidates: Vec<String> = std::mem::take(&mut execution.pending);
        for edge in workflow.outgoing_edges(&node.id) {
            if edge.edge_type != EdgeType::Normal {
                continue;
            }
            if let Some(condition) = &edge.condition {
                match expression::evaluate(condition, &execution.variables) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(edge = %edge.id, error = %e, "Edge condition failed to evaluate");
                        continue;
                    }
                }
            }
            let target = &edge.target;
            if execution.completed_nodes.contains(target)
                || execution.in_flight.contains(target)
                || candidates.contains(target)
            {
                continue;
            }
            if !join_ready(workflow, &execution, target) {
                continue;
            }
            candidates.push(target.clone());
        }

        // settings.concurrency bounds simultaneously in-flight nodes of
        // one execution; the overflow parks until something finishes.
        let budget = workflow
            .settings
            .concurrency
            .max(1)
            .saturating_sub(execution.in_flight.len());
        let parked: Vec<String> = candidates.split_off(budget.min(candidates.len()));
        let ready = candidates;
        execution.pending = parked;
        for target in &ready {
            execution.in_flight.insert(target.clone());
        }
        let workflow_done = execution.in_flight.is_empty() && execution.pending.is_empty();

        // Variables must be readable before node_completed is observable.
        self.store.put_execution(execution.clone()).await?;
        self.publish(Event::new(
            execution.id,
            Some(node.id.clone()),
            EventKind::NodeCompleted,
            json!({
                "duration_ms": metrics.duration_ms,
                "ai_tokens_used": metrics.ai_tokens_used,
                "ai_cost": metrics.ai_cost,
            }),
        ))
        .await?;

        for target in ready {
            self.queue.push_fresh(WorkItem {
                execution_id: execution.id,
                node_id: target,
                attempt: 0,
                resume: None,
            });
        }

        if workflow_done {
            self.store
                .set_execution_status(execution.id, ExecutionStatus::Completed, None)
                .await?;
            self.publish(Event::new(
                execution.id,
                None,
                EventKind::WorkflowCompleted,
                json!({"workflow_id": workflow.id}),
            ))
            .await?;
            info!(execution_id = %execution.id, "Execution completed");
            if workflow.settings.notify_on_success {
                self.notifier
                    .workflow_finished(workflow.id, execution.id, "completed", None)
                    .await;
            }
        }
        Ok(())
    }

    async fn handle_node_failure(
        &self,
        workflow: &Workflow,
        execution: Execution,
        node: &Node,
        attempt: u32,
        error: ExecutorError,
        started_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let edge_wants_retry = workflow
            .incoming_edges(&node.id)
            .iter()
            .any(|edge| edge.retry_on_fail);
        let missing_variable = matches!(error, ExecutorError::MissingVariable(_));
        let retry_eligible =
            (error.is_retryable() || (edge_wants_retry && !missing_variable))
                && attempt < workflow.settings.max_retries;

        if retry_eligible {
            let delay = retry_backoff(&self.config, attempt);
            warn!(
                execution_id = %execution.id,
                node_id = %node.id,
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Node failed; retrying"
            );
            self.spawn_requeue(
                WorkItem {
                    execution_id: execution.id,
                    node_id: node.id.clone(),
                    attempt: attempt + 1,
                    resume: None,
                },
                delay,
            );
            return Ok(());
        }

        self.terminal_node_failure(workflow, execution, node, error.to_string(), started_at)
            .await
    }

    /// A node failed past its retry budget: record history, emit
    /// `node_failed`, reroute through error edges when present, otherwise
    /// fail the workflow.
    async fn terminal_node_failure(
        &self,
        workflow: &Workflow,
        mut execution: Execution,
        node: &Node,
        error: String,
        started_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        execution.in_flight.remove(&node.id);
        execution.node_history.push(NodeHistoryEntry {
            node_id: node.id.clone(),
            started_at,
            ended_at: Utc::now(),
            status: NodeRunStatus::Failed,
            output: None,
            error: Some(error.clone()),
            metrics: NodeMetrics::default(),
        });

        let error_targets: Vec<String> = workflow
            .outgoing_edges(&node.id)
            .iter()
            .filter(|edge| edge.edge_type == EdgeType::Error)
            .map(|edge| edge.target.clone())
            .filter(|target| {
                !execution.completed_nodes.contains(target) && !execution.in_flight.contains(target)
            })
            .collect();
        for target in &error_targets {
            execution.in_flight.insert(target.clone());
        }

        self.store.put_execution(execution.clone()).await?;
        self.publish(Event::new(
            execution.id,
            Some(node.id.clone()),
            EventKind::NodeFailed,
            json!({"error": error}),
        ))
        .await?;

        if error_targets.is_empty() {
            return self.fail_execution(workflow, execution.id, error).await;
        }
        info!(
            execution_id = %execution.id,
            node_id = %node.id,
            targets = error_targets.len(),
            "Rerouting failure through error edges"
        );
        for target in error_targets {
            self.queue.push_fresh(WorkItem {
                execution_id: execution.id,
                node_id: target,
                attempt: 0,
                resume: None,
            });
        }
        Ok(())
    }

    async fn fail_execution(
        &self,
        workflow: &Workflow,
        execution_id: Uuid,
        error: String,
    ) -> Result<(), EngineError> {
        self.store
            .set_execution_status(execution_id, ExecutionStatus::Failed, Some(error.clone()))
            .await?;
        self.publish(Event::new(
            execution_id,
            None,
            EventKind::WorkflowFailed,
            json!({"reason": error}),
        ))
        .await?;
        warn!(execution_id = %execution_id, error = %error, "Execution failed");
        if workflow.settings.notify_on_failure {
            self.notifier
                .workflow_finished(workflow.id, execution_id, "failed", Some(&error))
                .await;
        }
        Ok(())
    }

    async fn handle_resume(
        &self,
        workflow: &Workflow,
        execution: Execution,
        item: &WorkItem,
        action: ResumeAction,
    ) -> Result<(), EngineError> {
        if execution.status.is_terminal() || execution.completed_nodes.contains(&item.node_id) {
            debug!(
                execution_id = %execution.id,
                node_id = %item.node_id,
                "Dropping stale resumption"
            );
            return Ok(());
        }
        if execution.status != ExecutionStatus::Paused
            || execution.current_node_id.as_deref() != Some(item.node_id.as_str())
        {
            // The suspension may still be settling on another worker; a
            // response can race the paused-state write.
            if item.attempt < 200 {
                let mut retry = item.clone();
                retry.attempt += 1;
                self.spawn_requeue_resume(retry, Duration::from_millis(20));
            } else {
                warn!(
                    execution_id = %execution.id,
                    node_id = %item.node_id,
                    "Giving up on a resumption that never found its suspension"
                );
            }
            return Ok(());
        }
        let Some(node) = workflow.node(&item.node_id) else {
            return self
                .fail_execution(
                    workflow,
                    execution.id,
                    format!("unknown node: {}", item.node_id),
                )
                .await;
        };

        self.store.set_current_node(execution.id, None).await?;
        let mut execution = self
            .store
            .set_execution_status(execution.id, ExecutionStatus::Running, None)
            .await?;
        execution.current_node_id = None;

        let started_at = Utc::now();
        match action {
            ResumeAction::Approval { approved, payload } => {
                if approved {
                    let mut output = serde_json::Map::new();
                    output.insert("approved".to_string(), Value::Bool(true));
                    if let Value::Object(extra) = payload {
                        for (key, value) in extra {
                            output.insert(key, value);
                        }
                    }
                    self.complete_node(
                        workflow,
                        execution,
                        node,
                        Value::Object(output),
                        NodeMetrics::default(),
                        started_at,
                    )
                    .await
                } else {
                    self.terminal_node_failure(
                        workflow,
                        execution,
                        node,
                        "rejected".to_string(),
                        started_at,
                    )
                    .await
                }
            }
            ResumeAction::Timer => {
                let output = json!({"fired_at": Utc::now()});
                self.complete_node(
                    workflow,
                    execution,
                    node,
                    output,
                    NodeMetrics::default(),
                    started_at,
                )
                .await
            }
        }
    }

    fn schedule_timer_wakeup(
        &self,
        execution_id: Uuid,
        node_id: String,
        wake_at: DateTime<Utc>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            let wait = (wake_at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            engine.queue.push_resume(WorkItem {
                execution_id,
                node_id,
                attempt: 0,
                resume: Some(ResumeAction::Timer),
            });
        });
    }

    /// Deadline watchdog for an open ticket; applies the node's fallback
    /// policy when the deadline passes unanswered.
    fn schedule_approval_deadline(&self, ticket: ApprovalTicket, config: HumanTaskConfig) {
        let engine = self.clone();
        tokio::spawn(async move {
            let wait = (ticket.deadline - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            let Some(expired) = engine
                .approvals
                .expire(ticket.execution_id, &ticket.node_id, &ticket.token)
                .await
            else {
                return;
            };

            match config.fallback {
                ApprovalFallback::AutoApprove => {
                    engine.queue.push_resume(WorkItem {
                        execution_id: expired.execution_id,
                        node_id: expired.node_id.clone(),
                        attempt: 0,
                        resume: Some(ResumeAction::Approval {
                            approved: true,
                            payload: json!({"auto_approved": true}),
                        }),
                    });
                }
                ApprovalFallback::Cancel => {
                    if let Err(e) = engine
                        .fail_suspended_execution(expired.execution_id, "approval timeout")
                        .await
                    {
                        error!(
                            execution_id = %expired.execution_id,
                            error = %e,
                            "Failed to apply approval-timeout cancellation"
                        );
                    }
                }
                ApprovalFallback::Escalate => {
                    let assignee = config
                        .secondary_assignee
                        .clone()
                        .unwrap_or_else(|| config.assignee.clone());
                    let reissued = engine
                        .approvals
                        .issue(
                            expired.execution_id,
                            &expired.node_id,
                            &assignee,
                            config.timeout_ms,
                        )
                        .await;
                    // The escalated ticket's own deadline cancels.
                    let mut escalated = config.clone();
                    escalated.fallback = ApprovalFallback::Cancel;
                    escalated.secondary_assignee = None;
                    engine.schedule_approval_deadline(reissued, escalated);
                }
            }
        });
    }

    async fn fail_suspended_execution(
        &self,
        execution_id: Uuid,
        reason: &str,
    ) -> Result<(), EngineError> {
        let (key, token) = self
            .acquire_execution_lock(execution_id, self.config.lock_ttl_floor)
            .await?;
        let result = async {
            let execution = self.store.get_execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Ok(());
            }
            let workflow = self.store.get_workflow(execution.workflow_id).await?;
            self.fail_execution(&workflow, execution_id, reason.to_string())
                .await
        }
        .await;
        self.locks.release(&key, token).await;
        result
    }

    fn spawn_requeue(&self, item: WorkItem, delay: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.queue.push_fresh(item);
        });
    }

    fn spawn_requeue_resume(&self, item: WorkItem, delay: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.queue.push_resume(item);
        });
    }
}

/// Strict-AND join: a node runs once every incoming normal edge's source
/// has completed successfully.
fn join_ready(workflow: &Workflow, execution: &Execution, target: &str) -> bool {
    workflow
        .incoming_edges(target)
        .iter()
        .filter(|edge| edge.edge_type == EdgeType::Normal)
        .all(|edge| execution.completed_nodes.contains(&edge.source))
}

fn retry_backoff(config: &EngineConfig, attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt.min(16));
    (config.retry_base_delay * multiplier).min(config.retry_max_delay)
}
