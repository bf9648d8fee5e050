//! Built-in capabilities.
//!
//! Payload validation happens at each handler's boundary; the core never
//! inspects payloads centrally.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::outbox::{OutboxItem, OutboxStore};
use crate::registry::Capability;
use crate::task::Task;

/// Queues an outbound email on the outbox rather than sending inline, so
/// delivery gets the retry/backoff treatment regardless of which agent
/// asked for it.
pub struct SendEmailCapability {
    outbox: Arc<OutboxStore>,
}

#[derive(Debug, Deserialize)]
struct SendEmailPayload {
    to: Vec<String>,
    subject: String,
    body: String,
    #[serde(default)]
    html: Option<String>,
}

impl SendEmailCapability {
    pub fn new(outbox: Arc<OutboxStore>) -> Self {
        Self { outbox }
    }
}

#[async_trait]
impl Capability for SendEmailCapability {
    async fn handle(&self, task: &Task) -> anyhow::Result<serde_json::Value> {
        let payload: SendEmailPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| anyhow::anyhow!("invalid email payload: {}", e))?;
        if payload.to.is_empty() {
            anyhow::bail!("invalid email payload: no recipients");
        }

        let item = OutboxItem::new(payload.to, payload.subject, payload.body, payload.html);
        let item_id = item.id;
        self.outbox.enqueue(item).await?;

        tracing::info!(task_id = %task.id, outbox_id = %item_id, "Email queued for delivery");
        Ok(serde_json::json!({ "queued": true, "outbox_id": item_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_valid_payload_enqueues_item() {
        let temp = tempdir().unwrap();
        let outbox = Arc::new(OutboxStore::new(temp.path().join("outbox.json")));
        let capability = SendEmailCapability::new(Arc::clone(&outbox));

        let task = Task::new(
            "user-1",
            "email",
            "send",
            serde_json::json!({
                "to": ["friend@example.com"],
                "subject": "Thinking of you",
                "body": "Hi!"
            }),
        );

        let value = capability.handle(&task).await.unwrap();
        assert_eq!(value.get("queued").unwrap(), true);

        let items = outbox.load().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].subject, "Thinking of you");
        assert!(items[0].is_pending());
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected_without_enqueue() {
        let temp = tempdir().unwrap();
        let outbox = Arc::new(OutboxStore::new(temp.path().join("outbox.json")));
        let capability = SendEmailCapability::new(Arc::clone(&outbox));

        let task = Task::new("user-1", "email", "send", serde_json::json!({"subject": "x"}));
        assert!(capability.handle(&task).await.is_err());

        let task = Task::new(
            "user-1",
            "email",
            "send",
            serde_json::json!({"to": [], "subject": "x", "body": "y"}),
        );
        assert!(capability.handle(&task).await.is_err());

        assert!(outbox.load().await.unwrap().is_empty());
    }
}
