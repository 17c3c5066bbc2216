//! Workflow execution engine
//!
//! Advances executions through their node graphs on a shared worker pool.
//! Every mutation of an execution happens under its distributed lock;
//! human-task and timer nodes suspend by returning a sentinel, and the
//! approval subsystem resumes them on external callbacks.

pub mod approvals;
pub mod engine;
pub mod executors;
pub mod expression;
pub mod interpolate;
pub mod notify;
pub mod validate;

pub use approvals::{ApprovalAction, ApprovalOutcome, ApprovalService, ApprovalTicket};
pub use engine::{EngineConfig, LoggedEventSink, WorkflowEngine};
pub use executors::{ExecutorError, ExecutorOutcome, NodeExecutor, Suspension};
pub use notify::Notifier;
pub use validate::validate_workflow;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] state_store::StoreError),

    #[error("Lock acquisition failed: {0}")]
    Lock(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid approval token")]
    InvalidToken,

    #[error("Approval token expired")]
    TokenExpired,

    #[error("Approval already consumed")]
    TicketConsumed,
}
