//! Typed errors for the orchestration core.

use uuid::Uuid;

use crate::task::TaskStatus;

/// Errors produced by the task orchestration core.
///
/// Only `Handler` escapes a worker run; approval and resolution failures
/// render `ApprovalRequired` / `CapabilityNotFound` into the task's recorded
/// outcome and never propagate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("agent not found: {name}")]
    CapabilityNotFound { name: String },

    #[error("requires user approval")]
    ApprovalRequired,

    #[error("task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("capability handler failed: {0}")]
    Handler(anyhow::Error),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Errors from an outbox transport backend.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(String),

    #[error("smtp session failed: {0}")]
    Smtp(String),

    #[error("delivery rejected: {status} {body}")]
    Rejected { status: u16, body: String },
}
