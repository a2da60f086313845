//! Event hook system for coordinator-based execution
//!
//! Hooks process events and return commands, never directly mutating state.

use super::types::{ExecutionEvent, ExecutorCommand};
use async_trait::async_trait;

/// Context provided to hooks for processing events
pub struct HookContext {
    /// Run ID for this execution
    pub run_id: String,
    /// DAG name being executed
    pub dag_name: String,
    pub cache: crate::dag_flow::Cache,
}

impl HookContext {
    /// Create a new hook context
    pub fn new(
        run_id: impl Into<String>,
        dag_name: impl Into<String>,
        cache: crate::dag_flow::Cache,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            dag_name: dag_name.into(),
            cache,
        }
    }
}

/// Event hook trait - processes events and returns commands
#[async_trait]
pub trait EventHook: Send + Sync {
    /// Handle an execution event and return commands to apply
    async fn handle(&self, ctx: &HookContext, event: &ExecutionEvent) -> Vec<ExecutorCommand>;

    /// Optional: Called when the DAG execution starts
    async fn on_start(&self, _ctx: &HookContext) -> Vec<ExecutorCommand> {
        Vec::new()
    }

    /// Optional: Called when the DAG execution completes
    async fn on_complete(&self, _ctx: &HookContext, _success: bool) {}
}

/// Logs every node transition
pub struct LoggingHook;

#[async_trait]
impl EventHook for LoggingHook {
    async fn handle(&self, _ctx: &HookContext, event: &ExecutionEvent) -> Vec<ExecutorCommand> {
        match event {
            ExecutionEvent::NodeStarted { node, attempt } => {
                tracing::info!(node_id = %node.node_id, attempt, "Node started");
            }
            ExecutionEvent::NodeCompleted { node, outcome, .. } => {
                tracing::info!(
                    node_id = %node.node_id,
                    commands = outcome.commands.len(),
                    "Node completed"
                );
            }
            ExecutionEvent::NodeFailed { node, error, .. } => {
                tracing::error!(node_id = %node.node_id, "Node failed: {}", error);
            }
            ExecutionEvent::NodeSkipped { node, status, reason } => {
                tracing::warn!(node_id = %node.node_id, ?status, "Node skipped: {}", reason);
            }
        }
        Vec::new()
    }

    async fn on_complete(&self, ctx: &HookContext, success: bool) {
        tracing::info!(dag = %ctx.dag_name, run_id = %ctx.run_id, success, "Run finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::types::{NodeOutcome, NodeRef};
    use crate::dag_flow::{Cache, NodeStatus};

    #[tokio::test]
    async fn test_logging_hook_never_mutates() {
        let ctx = HookContext::new("run", "dag", Cache::new());
        let node = NodeRef {
            dag_name: "dag".to_string(),
            node_id: "analyze_0_0_1".to_string(),
        };
        let events = vec![
            ExecutionEvent::NodeStarted {
                node: node.clone(),
                attempt: 1,
            },
            ExecutionEvent::NodeCompleted {
                node: node.clone(),
                outcome: NodeOutcome {
                    outputs: None,
                    commands: vec![ExecutorCommand::ExitBranch {
                        branch_id: "0_0_1".to_string(),
                        reason: None,
                    }],
                },
                retry_messages: Vec::new(),
            },
            ExecutionEvent::NodeSkipped {
                node,
                status: NodeStatus::Exited,
                reason: "branch exited".to_string(),
            },
        ];
        for event in &events {
            assert!(LoggingHook.handle(&ctx, event).await.is_empty());
        }
        assert!(LoggingHook.on_start(&ctx).await.is_empty());
    }
}
