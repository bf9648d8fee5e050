//! Task and lifecycle types.
//!
//! A task is a unit of work created by a supervisor (a human, the system, or
//! another agent) and assigned to a named capability. The status machine is
//! monotonic: `Pending -> InProgress -> {Completed | Failed}`, or
//! `Pending -> Cancelled`. Terminal states are absorbing; tasks are never
//! deleted so the history stays inspectable.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (absorbing).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the monotonic state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }
}

/// Safety classification attached by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Low,
    Medium,
    High,
}

/// Task metadata. The keys the core itself interprets are typed fields;
/// everything else rides along in `extra` untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub require_user_approval: bool,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_level: Option<SafetyLevel>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Terminal outcome recorded on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { value: serde_json::Value },
    Error { error: String },
}

/// A unit of work with a lifecycle, assigned to a named capability.
///
/// The `agent` field is a name, not a reference: it is resolved against the
/// registry at dispatch time, so a task may be created before its capability
/// is registered and must fail cleanly if it is still missing when run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Identifier of the requesting entity.
    pub supervisor: String,
    /// Capability name resolved at dispatch time.
    pub agent: String,
    /// Discriminator interpreted by the capability handler.
    pub action: String,
    /// Opaque structured data, interpreted only by the handler.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub status: TaskStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskOutcome>,
}

impl Task {
    pub fn new(
        supervisor: impl Into<String>,
        agent: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            supervisor: supervisor.into(),
            agent: agent.into(),
            action: action.into(),
            payload,
            metadata: TaskMetadata::default(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            result: None,
        }
    }

    /// Whether the approval gate blocks execution.
    pub fn approval_pending(&self) -> bool {
        self.metadata.require_user_approval && !self.metadata.approved
    }
}
