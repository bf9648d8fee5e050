//! Concurrent fan-out over independent tool calls.
//!
//! Collapses N sequential capability round-trips into one concurrent
//! round-trip: every call in a batch is dispatched at once and all outcomes
//! are joined before returning. One slow or failing call never blocks or
//! poisons the others, and no individual error propagates - every outcome,
//! success or failure, becomes a uniform result record keyed by call id.
//!
//! The executor imposes no per-call timeout; callers wanting bounded latency
//! enforce it inside the capability handler or around the whole batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::registry::CapabilityRegistry;
use crate::task::Task;

/// One requested tool invocation. Ephemeral; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub result: serde_json::Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Handler wall-clock time in milliseconds.
    pub execution_time_ms: u64,
}

/// Dispatches batches of tool calls through the capability registry.
pub struct FanOutExecutor {
    registry: Arc<CapabilityRegistry>,
    /// Fixed tool-name -> agent-name mapping; names absent here map to
    /// themselves.
    tool_agents: HashMap<String, String>,
}

impl FanOutExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            tool_agents: HashMap::new(),
        }
    }

    pub fn with_tool_mapping(mut self, tool_agents: HashMap<String, String>) -> Self {
        self.tool_agents = tool_agents;
        self
    }

    fn agent_for(&self, tool_name: &str) -> String {
        self.tool_agents
            .get(tool_name)
            .cloned()
            .unwrap_or_else(|| tool_name.to_string())
    }

    /// Execute every call in the batch concurrently and join all outcomes.
    ///
    /// Returns exactly one result per call, in input order. Batch wall-clock
    /// time is bounded by the slowest call, not the sum.
    pub async fn execute_batch(&self, calls: Vec<ToolCall>, supervisor: &str) -> Vec<ToolResult> {
        let futures = calls
            .into_iter()
            .map(|call| self.execute_one(call, supervisor));
        join_all(futures).await
    }

    async fn execute_one(&self, call: ToolCall, supervisor: &str) -> ToolResult {
        let agent = self.agent_for(&call.name);
        // Ephemeral task synthesized for the handler contract only.
        let task = Task::new(supervisor, agent.clone(), call.name.clone(), call.args);

        let started = Instant::now();
        let outcome = match self.registry.resolve(&agent).await {
            Some(handler) => handler.handle(&task).await,
            None => Err(CoreError::CapabilityNotFound { name: agent.clone() }.into()),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(value) => ToolResult {
                tool_call_id: call.id,
                tool_name: call.name,
                result: value,
                success: true,
                error: None,
                execution_time_ms: elapsed.as_millis() as u64,
            },
            Err(e) => {
                tracing::debug!(tool = %call.name, "Tool call failed: {}", e);
                ToolResult {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    result: serde_json::Value::Null,
                    success: false,
                    error: Some(e.to_string()),
                    execution_time_ms: elapsed.as_millis() as u64,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Capability;
    use async_trait::async_trait;
    use std::time::Duration;

    struct SlowEcho {
        delay: Duration,
    }

    #[async_trait]
    impl Capability for SlowEcho {
        async fn handle(&self, task: &Task) -> anyhow::Result<serde_json::Value> {
            tokio::time::sleep(self.delay).await;
            Ok(task.payload.clone())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Capability for AlwaysFails {
        async fn handle(&self, _task: &Task) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("deliberate failure")
        }
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            args: serde_json::json!({"id": id}),
        }
    }

    #[tokio::test]
    async fn test_one_failure_does_not_poison_the_batch() {
        let registry = Arc::new(CapabilityRegistry::new());
        registry
            .register("echo", "Echo", Arc::new(SlowEcho { delay: Duration::from_millis(1) }))
            .await;
        registry.register("boom", "Fails", Arc::new(AlwaysFails)).await;
        let executor = FanOutExecutor::new(registry);

        let calls = vec![call("c1", "echo"), call("c2", "boom"), call("c3", "echo")];
        let results = executor.execute_batch(calls, "batch-test").await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].tool_call_id, "c1");
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(results[1].error.as_deref(), Some("deliberate failure"));
        assert!(results[2].success);
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_failed_result() {
        let registry = Arc::new(CapabilityRegistry::new());
        let executor = FanOutExecutor::new(registry);

        let results = executor.execute_batch(vec![call("c1", "ghost")], "batch-test").await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        // The miss renders the typed registry-miss error, same as the worker.
        assert_eq!(
            results[0].error.as_deref(),
            Some(CoreError::CapabilityNotFound { name: "ghost".into() }.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_batch_runs_concurrently_not_sequentially() {
        let registry = Arc::new(CapabilityRegistry::new());
        registry
            .register(
                "slow",
                "Sleeps 50ms",
                Arc::new(SlowEcho { delay: Duration::from_millis(50) }),
            )
            .await;
        let executor = FanOutExecutor::new(registry);

        let calls = vec![call("c1", "slow"), call("c2", "slow"), call("c3", "slow")];
        let started = Instant::now();
        let results = executor.execute_batch(calls, "batch-test").await;
        let elapsed = started.elapsed();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        // Three 50ms calls joined concurrently: closer to 50ms than 150ms.
        assert!(
            elapsed < Duration::from_millis(120),
            "batch took {:?}, expected roughly one call's latency",
            elapsed
        );
        for r in &results {
            assert!(r.execution_time_ms >= 50);
        }
    }

    #[tokio::test]
    async fn test_tool_mapping_resolves_to_agent_name() {
        let registry = Arc::new(CapabilityRegistry::new());
        registry
            .register("echo", "Echo", Arc::new(SlowEcho { delay: Duration::from_millis(1) }))
            .await;
        let mapping = HashMap::from([("repeat_after_me".to_string(), "echo".to_string())]);
        let executor = FanOutExecutor::new(registry).with_tool_mapping(mapping);

        let results = executor
            .execute_batch(vec![call("c1", "repeat_after_me")], "batch-test")
            .await;
        assert!(results[0].success);
        assert_eq!(results[0].tool_name, "repeat_after_me");
    }
}
