//! Compute-only node actions
//!
//! Actions read their context, publish into the shared namespace and
//! return graph changes as commands. They never touch the executor.

use async_trait::async_trait;
use serde_json::Value;

use crate::coord::types::{ExecutorCommand, JobInfo};
use crate::dag_flow::Cache;

/// Context for node execution (immutable, clonable)
#[derive(Clone)]
pub struct NodeCtx {
    /// DAG name this node belongs to
    pub dag_name: String,
    /// Node ID
    pub node_id: String,
    /// Display name
    pub name: String,
    /// Node inputs
    pub inputs: Value,
    /// Execution-context metadata, inherited by appended children
    pub metadata: Value,
    pub branch: Option<String>,
    /// Direct parent ids
    pub parents: Vec<String>,
    /// Completion records of the direct parents
    pub job_info: Vec<JobInfo>,
    /// Shared namespace
    pub cache: Cache,
}

impl NodeCtx {
    /// Create a new node context
    pub fn new(
        dag_name: impl Into<String>,
        node_id: impl Into<String>,
        inputs: Value,
        cache: Cache,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            dag_name: dag_name.into(),
            name: node_id.clone(),
            node_id,
            inputs,
            metadata: Value::Object(serde_json::Map::new()),
            branch: None,
            parents: Vec::new(),
            job_info: Vec::new(),
            cache,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_parents(mut self, parents: Vec<String>, job_info: Vec<JobInfo>) -> Self {
        self.parents = parents;
        self.job_info = job_info;
        self
    }

    /// Get input value by key
    pub fn get_input<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .inputs
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Input '{}' not found on node '{}'", key, self.node_id))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))
    }

    /// Get optional input value
    pub fn get_input_opt<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        match self.inputs.get(key) {
            Some(value) if !value.is_null() => {
                let parsed = serde_json::from_value(value.clone())
                    .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        }
    }

    /// Optional metadata field
    pub fn get_metadata<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.metadata
            .get(key)
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Output from node execution
#[derive(Debug, Clone)]
pub struct NodeOutput {
    /// Outputs reported with the completion event (optional)
    pub outputs: Option<Value>,
    /// Whether the node succeeded
    pub success: bool,
    /// Graph changes requested by this execution
    pub commands: Vec<ExecutorCommand>,
}

impl NodeOutput {
    /// Create a successful output
    pub fn success(outputs: Value) -> Self {
        Self {
            outputs: Some(outputs),
            success: true,
            commands: Vec::new(),
        }
    }

    /// Create a successful output with no data
    pub fn success_empty() -> Self {
        Self {
            outputs: None,
            success: true,
            commands: Vec::new(),
        }
    }

    /// Attach a command for the coordinator
    pub fn with_command(mut self, command: ExecutorCommand) -> Self {
        self.commands.push(command);
        self
    }
}

/// NodeAction - compute-only node action
///
/// Actions are pure computation - they read inputs, perform work,
/// and return outputs. No direct executor mutation allowed.
#[async_trait]
pub trait NodeAction: Send + Sync {
    /// Get the name of this action
    fn name(&self) -> &str;

    /// Execute the node action
    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput>;
}
