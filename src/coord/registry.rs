//! Name → action table the coordinator resolves nodes against.
//!
//! Graphs are checked against the table when loaded and when nodes are
//! appended at runtime, so a worker is never spawned for an unknown action.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::coord::action::NodeAction;
use crate::core::errors::{FlowError, Result};
use crate::dag_flow::Node;

/// Actions keyed by [`NodeAction::name`]. Clones share the same table.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: Arc<RwLock<BTreeMap<String, Arc<dyn NodeAction>>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action. A second action with the same name replaces the
    /// first.
    pub fn register(&self, action: Arc<dyn NodeAction>) {
        let name = action.name().to_string();
        if self.actions.write().insert(name.clone(), action).is_some() {
            warn!(action = %name, "Replaced registered action");
        } else {
            debug!(action = %name, "Registered action");
        }
    }

    /// The action a node names
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn NodeAction>> {
        let action = self.actions.read().get(name).cloned();
        action.ok_or_else(|| self.not_registered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.read().contains_key(name)
    }

    /// Registered action names, sorted
    pub fn names(&self) -> Vec<String> {
        self.actions.read().keys().cloned().collect()
    }

    /// Fail on the first node whose action is not registered
    pub fn check_nodes(&self, nodes: &[Node]) -> Result<()> {
        match nodes.iter().find(|n| !self.contains(&n.action)) {
            Some(node) => Err(self.not_registered(format!("{} (node {})", node.action, node.id))),
            None => Ok(()),
        }
    }

    fn not_registered(&self, what: String) -> FlowError {
        FlowError::ActionNotRegistered(format!("{}; registered: [{}]", what, self.names().join(", ")))
    }
}
