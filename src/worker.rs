//! Single-task execution.
//!
//! The worker owns every mutation of the task store and audit trail. It runs
//! one task at a time on the caller's tokio task and may be invoked
//! concurrently against different task ids. Execution re-reads the task by
//! id at each entry point, which is what keeps the design tolerant of
//! process restarts.
//!
//! Propagation policy: only a capability handler error escapes `run`.
//! Approval-gate and resolution failures are recorded on the task and
//! returned as an ordinary (failed) task; alignment-monitor errors are
//! logged and swallowed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditStatus, SharedAuditTrail};
use crate::error::CoreError;
use crate::registry::CapabilityRegistry;
use crate::task::{Task, TaskOutcome, TaskStatus};
use crate::task_store::SharedTaskStore;

/// Feedback produced by a post-hoc alignment review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
    pub confidence: f32,
}

/// External collaborator reviewing completed tasks.
///
/// Best-effort only: whatever this returns or raises never changes a task's
/// terminal status.
#[async_trait]
pub trait AlignmentMonitor: Send + Sync {
    async fn review(&self, task: &Task) -> anyhow::Result<Option<AlignmentFeedback>>;
}

/// Executes tasks against the capability registry, recording lifecycle
/// state to the task store and audit trail.
pub struct Worker {
    store: SharedTaskStore,
    audit: SharedAuditTrail,
    registry: Arc<CapabilityRegistry>,
    monitor: Option<Arc<dyn AlignmentMonitor>>,
}

impl Worker {
    pub fn new(
        store: SharedTaskStore,
        audit: SharedAuditTrail,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            store,
            audit,
            registry,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn AlignmentMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Supervisor entry point: persist a new pending task and record its
    /// `created` event.
    pub async fn submit(&self, task: Task) -> Result<Task, CoreError> {
        if task.status != TaskStatus::Pending {
            return Err(CoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        self.store.append(task.clone()).await?;
        self.audit
            .record(AuditEvent::new(&task, AuditStatus::Created, None))
            .await?;
        tracing::info!(task_id = %task.id, agent = %task.agent, "Task submitted");
        Ok(task)
    }

    /// Cancel a task. Allowed only while pending; once in progress the
    /// handler runs to completion or failure.
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task, CoreError> {
        let mut task = self
            .store
            .get(task_id)
            .await
            .ok_or(CoreError::TaskNotFound { id: task_id })?;

        if task.status != TaskStatus::Pending {
            return Err(CoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Cancelled,
            });
        }

        task.status = TaskStatus::Cancelled;
        let task = self
            .store
            .update(task)
            .await?
            .ok_or(CoreError::TaskNotFound { id: task_id })?;
        self.audit
            .record(AuditEvent::new(&task, AuditStatus::Cancelled, None))
            .await?;
        tracing::info!(task_id = %task.id, "Task cancelled");
        Ok(task)
    }

    /// Run one pending task to a terminal state.
    ///
    /// Returns the terminal task for contained failures (approval gate,
    /// unknown agent); returns `Err(CoreError::Handler)` only when the
    /// capability handler itself failed, so a supervising loop can react.
    pub async fn run(&self, task_id: Uuid) -> Result<Task, CoreError> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or(CoreError::TaskNotFound { id: task_id })?;

        if task.status != TaskStatus::Pending {
            return Err(CoreError::InvalidTransition {
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }

        // Approval gate: fail before the handler is ever resolved.
        if task.approval_pending() {
            tracing::warn!(task_id = %task.id, "Task blocked by approval gate");
            return Ok(self
                .fail(task, CoreError::ApprovalRequired.to_string())
                .await?);
        }

        // Start.
        let mut task = task;
        task.status = TaskStatus::InProgress;
        let task = self
            .store
            .update(task)
            .await?
            .ok_or(CoreError::TaskNotFound { id: task_id })?;
        self.audit
            .record(AuditEvent::new(&task, AuditStatus::Started, None))
            .await?;

        // Resolve. A miss is contained, not propagated.
        let handler = match self.registry.resolve(&task.agent).await {
            Some(h) => h,
            None => {
                let message = CoreError::CapabilityNotFound {
                    name: task.agent.clone(),
                }
                .to_string();
                tracing::warn!(task_id = %task.id, "{}", message);
                return Ok(self.fail(task, message).await?);
            }
        };

        // Invoke and record.
        match handler.handle(&task).await {
            Ok(value) => {
                let mut task = task;
                task.status = TaskStatus::Completed;
                task.result = Some(TaskOutcome::Success { value });
                let task = self
                    .store
                    .update(task)
                    .await?
                    .ok_or(CoreError::TaskNotFound { id: task_id })?;
                self.audit
                    .record(AuditEvent::new(&task, AuditStatus::Completed, None))
                    .await?;
                tracing::info!(task_id = %task.id, agent = %task.agent, "Task completed");

                Ok(self.run_alignment_check(task).await)
            }
            Err(e) => {
                let message = e.to_string();
                self.fail(task, message).await?;
                Err(CoreError::Handler(e))
            }
        }
    }

    /// Transition to failed with one matching audit event.
    async fn fail(&self, mut task: Task, error: String) -> Result<Task, CoreError> {
        let id = task.id;
        task.status = TaskStatus::Failed;
        task.result = Some(TaskOutcome::Error {
            error: error.clone(),
        });
        let task = self
            .store
            .update(task)
            .await?
            .ok_or(CoreError::TaskNotFound { id })?;
        self.audit
            .record(AuditEvent::new(&task, AuditStatus::Failed, Some(error)))
            .await?;
        Ok(task)
    }

    /// Post-hoc alignment review. Feedback is merged into metadata as a
    /// non-authoritative annotation; any error here is logged and swallowed.
    async fn run_alignment_check(&self, task: Task) -> Task {
        let Some(monitor) = &self.monitor else {
            return task;
        };

        match monitor.review(&task).await {
            Ok(Some(feedback)) => {
                let mut annotated = task.clone();
                match serde_json::to_value(&feedback) {
                    Ok(value) => {
                        annotated
                            .metadata
                            .extra
                            .insert("alignment_feedback".to_string(), value);
                        match self.store.update(annotated).await {
                            Ok(Some(updated)) => return updated,
                            Ok(None) => {
                                tracing::warn!(task_id = %task.id, "Task vanished during alignment annotation")
                            }
                            Err(e) => {
                                tracing::warn!(task_id = %task.id, "Failed to persist alignment feedback: {}", e)
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, "Unserializable alignment feedback: {}", e)
                    }
                }
                task
            }
            Ok(None) => task,
            Err(e) => {
                tracing::warn!(task_id = %task.id, "Alignment check failed: {}", e);
                task
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditTrail;
    use crate::registry::Capability;
    use crate::task_store::TaskStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingEcho {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Capability for CountingEcho {
        async fn handle(&self, task: &Task) -> anyhow::Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(task.payload.clone())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Capability for AlwaysFails {
        async fn handle(&self, _task: &Task) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("simulated handler failure")
        }
    }

    struct FeedbackMonitor;

    #[async_trait]
    impl AlignmentMonitor for FeedbackMonitor {
        async fn review(&self, _task: &Task) -> anyhow::Result<Option<AlignmentFeedback>> {
            Ok(Some(AlignmentFeedback {
                kind: "tone".to_string(),
                message: "response was appropriate".to_string(),
                suggested_action: None,
                confidence: 0.9,
            }))
        }
    }

    struct BrokenMonitor;

    #[async_trait]
    impl AlignmentMonitor for BrokenMonitor {
        async fn review(&self, _task: &Task) -> anyhow::Result<Option<AlignmentFeedback>> {
            anyhow::bail!("monitor unavailable")
        }
    }

    struct Harness {
        _temp: tempfile::TempDir,
        store: SharedTaskStore,
        audit: SharedAuditTrail,
        registry: Arc<CapabilityRegistry>,
    }

    impl Harness {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            Self {
                store: Arc::new(TaskStore::new(temp.path().join("tasks.json"))),
                audit: Arc::new(AuditTrail::new(temp.path().join("audit.log"))),
                registry: Arc::new(CapabilityRegistry::new()),
                _temp: temp,
            }
        }

        fn worker(&self) -> Worker {
            Worker::new(
                Arc::clone(&self.store),
                Arc::clone(&self.audit),
                Arc::clone(&self.registry),
            )
        }
    }

    fn audit_statuses(events: &[AuditEvent]) -> Vec<AuditStatus> {
        events.iter().map(|e| e.status).collect()
    }

    #[tokio::test]
    async fn test_successful_run_records_full_lifecycle() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        h.registry
            .register("echo", "Echo", Arc::new(CountingEcho { calls: Arc::clone(&calls) }))
            .await;
        let worker = h.worker();

        let task = Task::new("user-1", "echo", "echo", serde_json::json!({"k": "v"}));
        let id = task.id;
        worker.submit(task).await.unwrap();
        let done = worker.run(id).await.unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert!(matches!(done.result, Some(TaskOutcome::Success { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events = h.audit.events_for_task(id).await.unwrap();
        assert_eq!(
            audit_statuses(&events),
            vec![AuditStatus::Created, AuditStatus::Started, AuditStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_approval_gate_blocks_without_invoking_handler() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        h.registry
            .register("echo", "Echo", Arc::new(CountingEcho { calls: Arc::clone(&calls) }))
            .await;
        let worker = h.worker();

        let mut task = Task::new("user-1", "echo", "echo", serde_json::Value::Null);
        task.metadata.require_user_approval = true;
        let id = task.id;
        worker.submit(task).await.unwrap();

        // Gate failure is contained, not propagated, and records the typed
        // approval error.
        let failed = worker.run(id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        let expected = CoreError::ApprovalRequired.to_string();
        assert!(matches!(
            failed.result,
            Some(TaskOutcome::Error { ref error }) if *error == expected
        ));
        assert_eq!(expected, "requires user approval");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // One created + one failed event, no started event.
        let events = h.audit.events_for_task(id).await.unwrap();
        assert_eq!(
            audit_statuses(&events),
            vec![AuditStatus::Created, AuditStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_approved_task_passes_the_gate() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        h.registry
            .register("echo", "Echo", Arc::new(CountingEcho { calls: Arc::clone(&calls) }))
            .await;
        let worker = h.worker();

        let mut task = Task::new("user-1", "echo", "echo", serde_json::Value::Null);
        task.metadata.require_user_approval = true;
        task.metadata.approved = true;
        let id = task.id;
        worker.submit(task).await.unwrap();

        let done = worker.run(id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_contained_failure() {
        let h = Harness::new();
        let worker = h.worker();

        let task = Task::new("user-1", "nonexistent", "do", serde_json::Value::Null);
        let id = task.id;
        worker.submit(task).await.unwrap();

        let failed = worker.run(id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        let expected = CoreError::CapabilityNotFound { name: "nonexistent".into() }.to_string();
        assert!(matches!(
            failed.result,
            Some(TaskOutcome::Error { ref error }) if *error == expected
        ));
        assert_eq!(expected, "agent not found: nonexistent");

        let events = h.audit.events_for_task(id).await.unwrap();
        assert_eq!(
            audit_statuses(&events),
            vec![AuditStatus::Created, AuditStatus::Started, AuditStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_handler_error_propagates_and_fails_task() {
        let h = Harness::new();
        h.registry.register("boom", "Fails", Arc::new(AlwaysFails)).await;
        let worker = h.worker();

        let task = Task::new("user-1", "boom", "do", serde_json::Value::Null);
        let id = task.id;
        worker.submit(task).await.unwrap();

        let err = worker.run(id).await.unwrap_err();
        assert!(matches!(err, CoreError::Handler(_)));

        let failed = h.store.get(id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(matches!(
            failed.result,
            Some(TaskOutcome::Error { ref error }) if error == "simulated handler failure"
        ));

        let events = h.audit.events_for_task(id).await.unwrap();
        assert_eq!(
            audit_statuses(&events),
            vec![AuditStatus::Created, AuditStatus::Started, AuditStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_alignment_feedback_is_merged_into_metadata() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        h.registry
            .register("echo", "Echo", Arc::new(CountingEcho { calls }))
            .await;
        let worker = h.worker().with_monitor(Arc::new(FeedbackMonitor));

        let task = Task::new("user-1", "echo", "echo", serde_json::Value::Null);
        let id = task.id;
        worker.submit(task).await.unwrap();

        let done = worker.run(id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        let feedback = done.metadata.extra.get("alignment_feedback").unwrap();
        assert_eq!(feedback.get("type").unwrap(), "tone");

        // Annotation is persisted too.
        let stored = h.store.get(id).await.unwrap();
        assert!(stored.metadata.extra.contains_key("alignment_feedback"));
    }

    #[tokio::test]
    async fn test_monitor_error_never_affects_terminal_status() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        h.registry
            .register("echo", "Echo", Arc::new(CountingEcho { calls }))
            .await;
        let worker = h.worker().with_monitor(Arc::new(BrokenMonitor));

        let task = Task::new("user-1", "echo", "echo", serde_json::Value::Null);
        let id = task.id;
        worker.submit(task).await.unwrap();

        let done = worker.run(id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(!done.metadata.extra.contains_key("alignment_feedback"));
    }

    #[tokio::test]
    async fn test_cancel_only_while_pending() {
        let h = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        h.registry
            .register("echo", "Echo", Arc::new(CountingEcho { calls }))
            .await;
        let worker = h.worker();

        let task = Task::new("user-1", "echo", "echo", serde_json::Value::Null);
        let id = task.id;
        worker.submit(task).await.unwrap();

        let cancelled = worker.cancel(id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        // Terminal states are absorbing: neither run nor a second cancel works.
        assert!(matches!(
            worker.run(id).await,
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            worker.cancel(id).await,
            Err(CoreError::InvalidTransition { .. })
        ));

        let events = h.audit.events_for_task(id).await.unwrap();
        assert_eq!(
            audit_statuses(&events),
            vec![AuditStatus::Created, AuditStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn test_run_unknown_task_errors() {
        let h = Harness::new();
        let worker = h.worker();
        assert!(matches!(
            worker.run(Uuid::new_v4()).await,
            Err(CoreError::TaskNotFound { .. })
        ));
    }
}
