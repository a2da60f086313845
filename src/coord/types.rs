//! Core types for coordinator-based execution
//!
//! Workers report events; nodes and hooks request graph changes through
//! commands. Only the coordinator mutates the executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag_flow::NodeStatus;

/// Reference to a node in a DAG
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub dag_name: String,
    pub node_id: String,
}

/// Events that occur during node execution
#[derive(Clone, Debug)]
pub enum ExecutionEvent {
    NodeStarted {
        node: NodeRef,
        attempt: u8,
    },
    NodeCompleted {
        node: NodeRef,
        outcome: NodeOutcome,
        retry_messages: Vec<String>,
    },
    NodeFailed {
        node: NodeRef,
        error: String,
        retry_messages: Vec<String>,
    },
    /// Decided by the coordinator, never sent by a worker
    NodeSkipped {
        node: NodeRef,
        status: NodeStatus,
        reason: String,
    },
}

impl ExecutionEvent {
    pub fn node(&self) -> &NodeRef {
        match self {
            ExecutionEvent::NodeStarted { node, .. }
            | ExecutionEvent::NodeCompleted { node, .. }
            | ExecutionEvent::NodeFailed { node, .. }
            | ExecutionEvent::NodeSkipped { node, .. } => node,
        }
    }
}

/// Outcome of a successful node execution
#[derive(Clone, Debug)]
pub struct NodeOutcome {
    pub outputs: Option<Value>,
    /// Graph changes requested by the node
    pub commands: Vec<ExecutorCommand>,
}

/// Completion record of a parent, handed to its direct children
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub node_id: String,
    pub name: String,
    pub status: NodeStatus,
    pub metadata: Value,
}

/// Specification for a node to be added to the DAG
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Optional ID (will be generated if None)
    pub id: Option<String>,
    /// Display name, defaults to the id
    pub name: Option<String>,
    /// The action to execute
    pub action: String,
    /// Dependencies (node IDs that must reach a terminal state first)
    pub deps: Vec<String>,
    /// Input data for the node
    pub inputs: Value,
    /// Execution-context metadata
    pub metadata: Value,
    pub branch: Option<String>,
    pub allow_failed_parents: bool,
    /// Optional timeout in seconds
    pub timeout: Option<u64>,
    /// Optional attempt count
    pub try_count: Option<u8>,
}

impl NodeSpec {
    /// Create a new NodeSpec with minimal fields
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            action: action.into(),
            deps: Vec::new(),
            inputs: Value::Object(serde_json::Map::new()),
            metadata: Value::Object(serde_json::Map::new()),
            branch: None,
            allow_failed_parents: false,
            timeout: None,
            try_count: None,
        }
    }

    /// Set the node ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add dependencies
    pub fn with_deps(mut self, deps: Vec<String>) -> Self {
        self.deps = deps;
        self
    }

    /// Set inputs
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Run even when some parents failed
    pub fn allow_failed_parents(mut self) -> Self {
        self.allow_failed_parents = true;
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set attempt count
    pub fn with_retries(mut self, count: u8) -> Self {
        self.try_count = Some(count);
        self
    }
}

/// Commands that can mutate the executor state
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutorCommand {
    /// Add nodes atomically. When returned by a node, the node becomes a
    /// parent of every added node.
    AddNodes { dag_name: String, specs: Vec<NodeSpec> },
    /// Stop the remaining nodes of a branch
    ExitBranch {
        branch_id: String,
        reason: Option<String>,
    },
}
