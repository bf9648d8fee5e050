//! Append-only audit trail.
//!
//! Every task status transition produces exactly one event, written as one
//! JSON line to `{data_dir}/audit.log`. The file is never rewritten; reads
//! re-scan it from scratch so the trail stays available independent of the
//! task records themselves.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Lifecycle stage recorded by an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Created,
    Started,
    Completed,
    Failed,
    Cancelled,
}

/// One task lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub task_id: Uuid,
    pub agent: String,
    pub action: String,
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEvent {
    pub fn new(
        task: &crate::task::Task,
        status: AuditStatus,
        details: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            task_id: task.id,
            agent: task.agent.clone(),
            action: task.action.clone(),
            status,
            details,
        }
    }
}

/// Append-only JSON-lines event log.
pub struct AuditTrail {
    storage_path: PathBuf,
    // Serializes appends so concurrent workers cannot interleave lines.
    write_lock: Mutex<()>,
}

impl AuditTrail {
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one event to the trail.
    pub async fn record(&self, event: AuditEvent) -> Result<(), std::io::Error> {
        let line = serde_json::to_string(&event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.storage_path)?;
        writeln!(file, "{}", line)?;

        tracing::debug!(
            task_id = %event.task_id,
            status = ?event.status,
            "Audit event recorded"
        );
        Ok(())
    }

    /// All events, in append order. Lines that fail to parse are skipped
    /// with a warning rather than poisoning the whole trail.
    pub async fn all(&self) -> Result<Vec<AuditEvent>, std::io::Error> {
        if !self.storage_path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.storage_path)?;
        let mut events = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Skipping unparseable audit line: {}", e),
            }
        }
        Ok(events)
    }

    /// Events for one task, in append order.
    pub async fn events_for_task(&self, task_id: Uuid) -> Result<Vec<AuditEvent>, std::io::Error> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect())
    }
}

/// Shared audit trail handle.
pub type SharedAuditTrail = Arc<AuditTrail>;
