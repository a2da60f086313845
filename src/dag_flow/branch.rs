//! Branch state management for DAG Flow
//!
//! A branch groups every node that belongs to one adsorption site. Exiting a
//! branch stops its remaining nodes without touching sibling branches.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Branch execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchStatus {
    Running,
    /// Stopped by a node's decision (e.g. unfavorable adsorption)
    Exited,
    Failed,
    Completed,
}

/// Branch state information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchState {
    pub status: BranchStatus,
    pub reason: Option<String>,
    /// Node that moved the branch out of `Running`
    pub decided_by: Option<String>,
    pub updated_at: u64,
}

impl BranchState {
    pub fn running() -> Self {
        Self {
            status: BranchStatus::Running,
            reason: None,
            decided_by: None,
            updated_at: crate::dag_flow::events::now_ms(),
        }
    }
}

/// Branch registry for managing branch states
#[derive(Clone)]
pub struct BranchRegistry {
    branches: Arc<RwLock<HashMap<String, BranchState>>>,
}

impl BranchRegistry {
    pub fn new() -> Self {
        Self {
            branches: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new branch. Existing branches keep their state.
    pub fn register_branch(&self, branch_id: impl Into<String>) {
        let mut branches = self.branches.write();
        branches
            .entry(branch_id.into())
            .or_insert_with(BranchState::running);
    }

    fn transition(&self, branch_id: &str, status: BranchStatus, reason: Option<&str>, by: &str) {
        let mut branches = self.branches.write();
        let state = branches
            .entry(branch_id.to_string())
            .or_insert_with(BranchState::running);
        // Exits and failures are sticky.
        if matches!(state.status, BranchStatus::Exited | BranchStatus::Failed) {
            return;
        }
        state.status = status;
        state.reason = reason.map(|s| s.to_string());
        state.decided_by = Some(by.to_string());
        state.updated_at = crate::dag_flow::events::now_ms();
    }

    /// Stop every not-yet-started node of the branch
    pub fn exit_branch(&self, branch_id: &str, reason: Option<&str>, by: &str) {
        self.transition(branch_id, BranchStatus::Exited, reason, by);
    }

    pub fn fail_branch(&self, branch_id: &str, reason: Option<&str>, by: &str) {
        self.transition(branch_id, BranchStatus::Failed, reason, by);
    }

    /// Complete a branch
    pub fn complete_branch(&self, branch_id: &str) {
        let mut branches = self.branches.write();
        if let Some(state) = branches.get_mut(branch_id) {
            if state.status == BranchStatus::Running {
                state.status = BranchStatus::Completed;
                state.updated_at = crate::dag_flow::events::now_ms();
            }
        }
    }

    /// Get branch status
    pub fn get_status(&self, branch_id: &str) -> Option<BranchStatus> {
        let branches = self.branches.read();
        branches.get(branch_id).map(|s| s.status)
    }

    /// Get branch state
    pub fn get_state(&self, branch_id: &str) -> Option<BranchState> {
        let branches = self.branches.read();
        branches.get(branch_id).cloned()
    }

    pub fn is_exited(&self, branch_id: &str) -> bool {
        self.get_status(branch_id) == Some(BranchStatus::Exited)
    }

    /// Check if branch is running
    pub fn is_running(&self, branch_id: &str) -> bool {
        self.get_status(branch_id) == Some(BranchStatus::Running)
    }

    /// List all branches with their states
    pub fn list_branches(&self) -> HashMap<String, BranchState> {
        self.branches.read().clone()
    }
}

impl Default for BranchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_is_sticky_and_isolated() {
        let registry = BranchRegistry::new();
        registry.register_branch("0_0_0");
        registry.register_branch("0_0_1");

        registry.exit_branch("0_0_0", Some("unfavorable"), "select_0_0_0");
        registry.complete_branch("0_0_0");
        registry.register_branch("0_0_0");

        assert!(registry.is_exited("0_0_0"));
        assert!(registry.is_running("0_0_1"));

        let state = registry.get_state("0_0_0").unwrap();
        assert_eq!(state.reason.as_deref(), Some("unfavorable"));
        assert_eq!(state.decided_by.as_deref(), Some("select_0_0_0"));
    }

    #[test]
    fn test_complete_only_from_running() {
        let registry = BranchRegistry::new();
        registry.register_branch("a");
        registry.fail_branch("a", None, "n");
        registry.complete_branch("a");
        assert_eq!(registry.get_status("a"), Some(BranchStatus::Failed));

        registry.register_branch("b");
        registry.complete_branch("b");
        assert_eq!(registry.get_status("b"), Some(BranchStatus::Completed));
    }
}
