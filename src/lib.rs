// Core infrastructure modules
pub mod core {
    pub mod errors;
}

pub mod config;
pub mod dag_flow; // DAG model, shared namespace, branches, events
pub mod coord; // Coordinator-based parallel execution
pub mod adsorption; // Distance search workflow

// Re-exports for convenience
pub use core::errors::{FlowError, Result};
pub use config::{SelectionAlgorithm, SelectionConfig, SlabParams, WorkflowConfig};
pub use dag_flow::{Cache, DagConfig, DagExecutionReport, DagExecutor, NodeStatus};
pub use coord::{ActionRegistry, Coordinator, NodeAction, NodeCtx, NodeOutput};
pub use adsorption::*;
