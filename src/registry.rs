//! Capability registry.
//!
//! Maps a stable name to a capability handler. Registration happens once at
//! process start per capability; registering the same name again replaces
//! the prior entry. A resolution miss is not an error at this level - the
//! worker and executor surface it as a typed "capability not found" outcome.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::task::Task;

/// A named capability handler.
///
/// Handlers must not mutate the task store or audit trail themselves; only
/// the worker records lifecycle state.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<serde_json::Value>;
}

/// Public description of a registered capability.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
}

struct Registration {
    description: String,
    handler: Arc<dyn Capability>,
}

/// Concurrency-safe name -> handler map, populated at startup.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, Registration>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability, replacing any prior entry under the same name.
    pub async fn register(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn Capability>,
    ) {
        let name = name.into();
        let mut entries = self.entries.write().await;
        if entries
            .insert(
                name.clone(),
                Registration {
                    description: description.into(),
                    handler,
                },
            )
            .is_some()
        {
            tracing::debug!("Replaced capability registration: {}", name);
        } else {
            tracing::info!("Registered capability: {}", name);
        }
    }

    /// Look up a handler by name.
    pub async fn resolve(&self, name: &str) -> Option<Arc<dyn Capability>> {
        let entries = self.entries.read().await;
        entries.get(name).map(|r| Arc::clone(&r.handler))
    }

    /// List all registrations.
    pub async fn list(&self) -> Vec<CapabilityInfo> {
        let entries = self.entries.read().await;
        let mut infos: Vec<CapabilityInfo> = entries
            .iter()
            .map(|(name, r)| CapabilityInfo {
                name: name.clone(),
                description: r.description.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
