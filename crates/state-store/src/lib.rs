//! State store - typed persistence adapter
//!
//! Defines the domain model (workflows, executions, event log) and the
//! `StateStore` trait the engine and HTTP surface run against. Ships an
//! in-memory implementation; the trait is the seam for a durable document
//! database backend.

pub mod execution;
pub mod memory;
pub mod store;
pub mod workflow;

pub use execution::{
    Execution, ExecutionProgress, ExecutionStatus, NodeHistoryEntry, NodeMetrics, NodeRunStatus,
};
pub use memory::MemoryStore;
pub use store::{StateStore, WorkflowListFilter, WorkflowStats};
pub use workflow::{
    ApprovalFallback, ConditionConfig, DataConfig, Edge, EdgeType, HttpActionConfig,
    HumanTaskConfig, AiProcessorConfig, Node, NodeKind, TimerConfig, TransformConfig,
    TransformOperation, TriggerConfig, ValidationRules, Workflow, WorkflowMetadata,
    WorkflowPermissions, WorkflowSettings, WorkflowStatus,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Fatal store error: {0}")]
    Fatal(String),
}
