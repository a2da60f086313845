//! DAG model, shared namespace and executor state.
//!
//! Graphs are held as petgraph `DiGraph`s keyed by name. Nodes communicate
//! only through the [`Cache`], an append-only namespace where every
//! write-once key has exactly one producer.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::coord::action::NodeAction;
use crate::coord::registry::ActionRegistry;
use crate::coord::types::NodeSpec;
use crate::core::errors::{FlowError, Result};

use super::branch::BranchRegistry;
use super::events::EventSink;

/// Configuration for retry behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// Configuration for DAG execution behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DagConfig {
    /// Maximum number of nodes to execute in parallel
    pub max_parallel_nodes: usize,
    /// Timeout applied to nodes that do not set their own, in seconds
    pub default_timeout_secs: u64,
    /// Attempts applied to nodes that do not set their own
    pub max_attempts: u8,
    /// Retry strategy configuration
    pub retry_strategy: RetryStrategy,
    /// Capacity of the worker event channel
    pub event_capacity: usize,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 4,
            default_timeout_secs: 86_400,
            max_attempts: 1,
            retry_strategy: RetryStrategy::default(),
            event_capacity: 256,
        }
    }
}

impl DagConfig {
    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_nodes == 0 {
            return Err(FlowError::configuration(
                "max_parallel_nodes",
                "must be greater than 0",
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(FlowError::configuration(
                "default_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.max_attempts == 0 {
            return Err(FlowError::configuration(
                "max_attempts",
                "must be greater than 0",
            ));
        }
        if self.event_capacity == 0 {
            return Err(FlowError::configuration(
                "event_capacity",
                "must be greater than 0",
            ));
        }
        if let RetryStrategy::Exponential { multiplier, .. } = self.retry_strategy {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(FlowError::configuration(
                    "retry_strategy.multiplier",
                    "must be a finite value >= 1.0",
                ));
            }
        }
        Ok(())
    }

    /// Merges two configurations, with override_with taking precedence
    /// wherever it differs from the defaults
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self> {
        let defaults = Self::default();
        let pick = |over: usize, base: usize, def: usize| if over != def { over } else { base };
        let merged = Self {
            max_parallel_nodes: pick(
                override_with.max_parallel_nodes,
                base.max_parallel_nodes,
                defaults.max_parallel_nodes,
            ),
            default_timeout_secs: if override_with.default_timeout_secs
                != defaults.default_timeout_secs
            {
                override_with.default_timeout_secs
            } else {
                base.default_timeout_secs
            },
            max_attempts: if override_with.max_attempts != defaults.max_attempts {
                override_with.max_attempts
            } else {
                base.max_attempts
            },
            retry_strategy: if override_with.retry_strategy != defaults.retry_strategy {
                override_with.retry_strategy.clone()
            } else {
                base.retry_strategy.clone()
            },
            event_capacity: pick(
                override_with.event_capacity,
                base.event_capacity,
                defaults.event_capacity,
            ),
        };

        merged.validate()?;
        Ok(merged)
    }

    /// Delay before the retry following `attempt` (1-based)
    pub fn retry_delay_ms(&self, attempt: u8) -> u64 {
        match &self.retry_strategy {
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let delay = (*initial_delay_ms as f64 * multiplier.powi(exponent)).round() as u64;
                delay.min(*max_delay_ms)
            }
            RetryStrategy::Linear { delay_ms } => *delay_ms,
            RetryStrategy::Immediate => 0,
        }
    }
}

/// Terminal and non-terminal node states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Not run because a required parent failed or was skipped
    Skipped,
    /// Not run because its branch was exited by an upstream decision
    Exited,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Exited
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeStatus::Completed)
    }
}

/// A node in the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// The unique identifier of the node.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Nodes that must reach a terminal state before this one runs.
    pub dependencies: Vec<String>,
    /// The action to be executed by the node.
    pub action: String,
    /// Static inputs handed to the action.
    pub inputs: Value,
    /// Execution-context metadata (worker affinity, distance tags, ...).
    pub metadata: Value,
    /// The branch this node belongs to, if any.
    pub branch: Option<String>,
    /// Run even if some parents failed.
    pub allow_failed_parents: bool,
    /// The timeout for the node's action in seconds.
    pub timeout: u64,
    /// The number of attempts before the node is marked failed.
    pub try_count: u8,
}

impl Node {
    /// Materialize a spec, filling unset limits from the executor config
    pub fn from_spec(id: String, spec: NodeSpec, config: &DagConfig) -> Self {
        Node {
            name: spec.name.unwrap_or_else(|| id.clone()),
            id,
            dependencies: spec.deps,
            action: spec.action,
            inputs: spec.inputs,
            metadata: spec.metadata,
            branch: spec.branch,
            allow_failed_parents: spec.allow_failed_parents,
            timeout: spec.timeout.unwrap_or(config.default_timeout_secs),
            try_count: spec.try_count.unwrap_or(config.max_attempts).max(1),
        }
    }
}

/// Represents a graph of nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    pub description: String,
    /// The nodes in the graph.
    pub nodes: Vec<Node>,
    pub config: Option<DagConfig>,
}

/// One value published into the namespace
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SerializableData {
    /// Node that published the value
    pub producer: String,
    pub value: Value,
}

/// Shared, append-only namespace for node outputs.
///
/// Each key maps to the sequence of values published under it, in arrival
/// order. A key is either write-once (`publish`) or accumulating (`push`),
/// decided by its first write.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    pub data: Arc<DashMap<String, Vec<SerializableData>>>,
    /// Keys claimed by `publish`
    write_once: Arc<DashSet<String>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    fn conflict(key: &str, entries: &[SerializableData], producer: &str) -> FlowError {
        FlowError::KeyConflict {
            key: key.to_string(),
            owner: entries
                .first()
                .map(|d| d.producer.clone())
                .unwrap_or_default(),
            producer: producer.to_string(),
        }
    }

    /// Write-once publication. Fails if anything was already written under `key`.
    pub fn publish<T: Serialize>(&self, producer: &str, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        match self.data.entry(key.to_string()) {
            Entry::Occupied(existing) => Err(Self::conflict(key, existing.get(), producer)),
            Entry::Vacant(slot) => {
                // claimed while the entry is locked so `push` cannot interleave
                self.write_once.insert(key.to_string());
                slot.insert(vec![SerializableData {
                    producer: producer.to_string(),
                    value,
                }]);
                Ok(())
            }
        }
    }

    /// Append a value to the sequence under `key`. Fails on a published key.
    pub fn push<T: Serialize>(&self, producer: &str, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut entries = self.data.entry(key.to_string()).or_default();
        if self.write_once.contains(key) {
            return Err(Self::conflict(key, entries.value(), producer));
        }
        entries.push(SerializableData {
            producer: producer.to_string(),
            value,
        });
        Ok(())
    }

    /// First value published under `key`
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        match self.data.get(key).and_then(|entries| entries.first().cloned()) {
            Some(data) => Ok(Some(serde_json::from_value(data.value)?)),
            None => Ok(None),
        }
    }

    /// Every value published under `key`
    pub fn fetch<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Vec<T>> {
        let entries = match self.data.get(key) {
            Some(entries) => entries.clone(),
            None => return Ok(Vec::new()),
        };
        entries
            .into_iter()
            .map(|d| serde_json::from_value(d.value).map_err(FlowError::from))
            .collect()
    }

    /// Values published under `key` by any of the given producers
    pub fn fetch_from<T: for<'de> Deserialize<'de>>(
        &self,
        key: &str,
        producers: &[String],
    ) -> Result<Vec<T>> {
        let entries = match self.data.get(key) {
            Some(entries) => entries.clone(),
            None => return Ok(Vec::new()),
        };
        entries
            .into_iter()
            .filter(|d| producers.iter().any(|p| p == &d.producer))
            .map(|d| serde_json::from_value(d.value).map_err(FlowError::from))
            .collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub fn serialize_cache_to_prettyjson(cache: &Cache) -> Result<String> {
    let snapshot: std::collections::BTreeMap<String, Vec<SerializableData>> = cache
        .data
        .iter()
        .map(|m| (m.key().clone(), m.value().clone()))
        .collect();

    Ok(serde_json::to_string_pretty(&snapshot)?)
}

/// New types for reporting node and DAG execution outcomes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeExecutionOutcome {
    pub node_id: String,
    pub status: NodeStatus,
    /// Each retry's error message (if any).
    pub retry_messages: Vec<String>,
    /// The final error message recorded (if any) when the node ultimately fails.
    pub final_error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DagExecutionReport {
    /// The outcome for each node, in completion order.
    pub node_outcomes: Vec<NodeExecutionOutcome>,
    /// False if any node failed.
    pub overall_success: bool,
    /// Consolidated error messages of failed nodes.
    pub error: Option<String>,
}

impl DagExecutionReport {
    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_outcomes
            .iter()
            .find(|o| o.node_id == node_id)
            .map(|o| o.status)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.node_outcomes
            .iter()
            .filter(|o| o.status == status)
            .count()
    }
}

/// Helper function to create execution reports
pub(crate) fn create_execution_report(
    node_outcomes: Vec<NodeExecutionOutcome>,
    error: Option<String>,
) -> DagExecutionReport {
    let overall_success = node_outcomes
        .iter()
        .all(|o| o.status != NodeStatus::Failed);
    let error = error.or_else(|| {
        let error_messages: Vec<String> = node_outcomes
            .iter()
            .filter_map(|o| {
                o.final_error
                    .as_ref()
                    .map(|e| format!("{}: {}", o.node_id, e))
            })
            .collect();
        if !error_messages.is_empty() {
            Some(error_messages.join("\n"))
        } else {
            None
        }
    });

    DagExecutionReport {
        node_outcomes,
        overall_success,
        error,
    }
}

pub type PrebuiltDag = (DiGraph<Node, ()>, HashMap<String, NodeIndex>);

/// Holds graphs and the action registry; mutated only by the coordinator.
pub struct DagExecutor {
    /// A registry of custom actions.
    pub function_registry: ActionRegistry,
    /// The graph definitions, including dynamically appended nodes.
    pub graphs: Arc<RwLock<HashMap<String, Graph>>>,
    /// The prebuilt DAGs.
    pub prebuilt_dags: Arc<RwLock<HashMap<String, PrebuiltDag>>>,
    pub config: DagConfig,
    /// Branch registry for exit/fail tracking
    pub branches: BranchRegistry,
    /// Event sink for typed event emission
    pub event_sink: Option<Arc<dyn EventSink>>,
    node_id_counter: Arc<AtomicUsize>,
}

impl DagExecutor {
    pub fn new(config: Option<DagConfig>, registry: ActionRegistry) -> Result<Self> {
        let config = config.unwrap_or_default();
        config.validate()?;

        Ok(DagExecutor {
            function_registry: registry,
            graphs: Arc::new(RwLock::new(HashMap::new())),
            prebuilt_dags: Arc::new(RwLock::new(HashMap::new())),
            config,
            branches: BranchRegistry::new(),
            event_sink: None,
            node_id_counter: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Registers a custom action with the `DagExecutor`.
    pub fn register_action(&mut self, action: Arc<dyn NodeAction>) {
        self.function_registry.register(action);
    }

    pub fn set_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.event_sink = Some(sink);
    }

    /// Generate a unique node ID with a prefix
    pub fn gen_node_id(&self, prefix: &str) -> String {
        let counter = self.node_id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}_{}", prefix, counter)
    }

    /// Effective configuration of a loaded graph: the executor config
    /// merged with the graph's own, or the executor config alone.
    pub async fn config_for(&self, dag_name: &str) -> DagConfig {
        let graphs = self.graphs.read().await;
        graphs
            .get(dag_name)
            .and_then(|g| g.config.clone())
            .unwrap_or_else(|| self.config.clone())
    }

    /// Validates and installs a graph under its name
    pub async fn load_graph(&mut self, mut graph: Graph) -> Result<()> {
        if let Some(graph_config) = &graph.config {
            let merged = DagConfig::merge(&self.config, graph_config)?;
            graph.config = Some(merged);
        }

        let dag = self.build_dag_internal(&graph)?;
        let name = graph.name.clone();
        for node in &graph.nodes {
            if let Some(branch) = &node.branch {
                self.branches.register_branch(branch.clone());
            }
        }

        let mut graphs = self.graphs.write().await;
        let mut dags = self.prebuilt_dags.write().await;
        info!(dag = %name, nodes = graph.nodes.len(), "Loaded graph");
        graphs.insert(name.clone(), graph);
        dags.insert(name, dag);
        Ok(())
    }

    fn build_dag_internal(&self, graph: &Graph) -> Result<PrebuiltDag> {
        let mut dag = DiGraph::<Node, ()>::new();
        let mut node_indices = HashMap::new();

        for node in &graph.nodes {
            if node_indices.contains_key(&node.id) {
                return Err(FlowError::NodeAlreadyExists(node.id.clone()));
            }
            let node_index = dag.add_node(node.clone());
            node_indices.insert(node.id.clone(), node_index);
        }

        validate_node_dependencies(&graph.nodes, &node_indices)?;
        self.function_registry.check_nodes(&graph.nodes)?;

        for node in &graph.nodes {
            let dependent_node_index = node_indices[&node.id];
            for dependency_id in &node.dependencies {
                let dependency_node_index = node_indices[dependency_id];
                dag.add_edge(dependency_node_index, dependent_node_index, ());
            }
        }

        validate_dag_structure(&dag)?;
        Ok((dag, node_indices))
    }

    /// Adds a new node to an existing DAG with validation
    pub async fn add_node(&mut self, name: &str, spec: NodeSpec) -> Result<String> {
        self.function_registry.resolve(&spec.action)?;

        let mut graphs = self.graphs.write().await;
        let mut dags = self.prebuilt_dags.write().await;

        let (dag, indices) = dags
            .get_mut(name)
            .ok_or_else(|| FlowError::DagNotFound(name.to_string()))?;

        let node_id = spec
            .id
            .clone()
            .unwrap_or_else(|| self.gen_node_id(&spec.action));
        if indices.contains_key(&node_id) {
            return Err(FlowError::NodeAlreadyExists(node_id));
        }

        for dep_id in &spec.deps {
            if !indices.contains_key(dep_id) {
                return Err(FlowError::DependencyNotFound {
                    node_id: node_id.clone(),
                    dependency: dep_id.clone(),
                });
            }
        }

        let config = graphs
            .get(name)
            .and_then(|g| g.config.as_ref())
            .unwrap_or(&self.config);
        let node = Node::from_spec(node_id.clone(), spec, config);

        // Edges only point into a brand-new node, so no cycle can form.
        let node_index = dag.add_node(node.clone());
        indices.insert(node_id.clone(), node_index);
        for dep_id in &node.dependencies {
            dag.add_edge(indices[dep_id], node_index, ());
        }

        if let Some(branch) = &node.branch {
            if self.branches.get_status(branch).is_none() {
                self.branches.register_branch(branch.clone());
            }
        }
        if let Some(graph) = graphs.get_mut(name) {
            graph.nodes.push(node);
        }

        debug!("Successfully added node {} to DAG {}", node_id, name);
        Ok(node_id)
    }

    /// Look up a node by id
    pub async fn get_node(&self, dag_name: &str, node_id: &str) -> Option<Node> {
        let dags = self.prebuilt_dags.read().await;
        let (graph, node_map) = dags.get(dag_name)?;
        node_map.get(node_id).map(|&idx| graph[idx].clone())
    }

    /// All node ids of a DAG
    pub async fn node_ids(&self, dag_name: &str) -> Result<Vec<String>> {
        let dags = self.prebuilt_dags.read().await;
        let (_, node_map) = dags
            .get(dag_name)
            .ok_or_else(|| FlowError::DagNotFound(dag_name.to_string()))?;
        Ok(node_map.keys().cloned().collect())
    }

    /// Check if a node exists in a DAG
    pub async fn node_exists(&self, dag_name: &str, node_id: &str) -> bool {
        let dags = self.prebuilt_dags.read().await;
        dags.get(dag_name)
            .map(|(_, node_map)| node_map.contains_key(node_id))
            .unwrap_or(false)
    }

    /// Serialize a DAG's nodes and edges for inspection
    pub async fn serialize_graph_to_json(&self, dag_name: &str) -> Result<String> {
        let dags = self.prebuilt_dags.read().await;
        let (graph, _) = dags
            .get(dag_name)
            .ok_or_else(|| FlowError::DagNotFound(dag_name.to_string()))?;
        let nodes: Vec<Value> = graph
            .node_indices()
            .map(|i| {
                let node = &graph[i];
                json!({
                    "id": node.id,
                    "name": node.name,
                    "action": node.action,
                    "dependencies": node.dependencies,
                    "branch": node.branch,
                })
            })
            .collect();
        Ok(serde_json::to_string_pretty(&json!({ "name": dag_name, "nodes": nodes }))?)
    }
}

/// Validates the structure of the DAG.
pub fn validate_dag_structure(dag: &DiGraph<Node, ()>) -> Result<()> {
    if is_cyclic_directed(dag) {
        return Err(FlowError::InvalidGraph(
            "The graph is not a DAG as it contains cycles.".to_string(),
        ));
    }
    Ok(())
}

/// Validates the dependencies of the nodes.
pub fn validate_node_dependencies(
    nodes: &[Node],
    node_indices: &HashMap<String, NodeIndex>,
) -> Result<()> {
    for node in nodes {
        for dependency_id in &node.dependencies {
            if !node_indices.contains_key(dependency_id) {
                return Err(FlowError::DependencyNotFound {
                    node_id: node.id.clone(),
                    dependency: dependency_id.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::action::{NodeCtx, NodeOutput};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct NoopAction;

    #[async_trait]
    impl NodeAction for NoopAction {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
            Ok(NodeOutput::success_empty())
        }
    }

    fn node(id: &str, deps: &[&str]) -> Node {
        Node::from_spec(
            id.to_string(),
            NodeSpec::new("noop").with_deps(deps.iter().map(|d| d.to_string()).collect()),
            &DagConfig::default(),
        )
    }

    fn executor() -> DagExecutor {
        let registry = ActionRegistry::new();
        registry.register(Arc::new(NoopAction));
        DagExecutor::new(None, registry).unwrap()
    }

    #[test]
    fn test_publish_is_write_once() {
        let cache = Cache::new();
        cache.publish("trial_a", "0_0_0_1_energy", &-1.5).unwrap();

        let err = cache.publish("trial_b", "0_0_0_1_energy", &-2.0).unwrap_err();
        match err {
            FlowError::KeyConflict { owner, producer, .. } => {
                assert_eq!(owner, "trial_a");
                assert_eq!(producer, "trial_b");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cache.get::<f64>("0_0_0_1_energy").unwrap(), Some(-1.5));
    }

    #[test]
    fn test_push_cannot_extend_published_key() {
        let cache = Cache::new();
        cache.publish("trial_a", "0_0_0_1_energy", &-1.5).unwrap();

        let err = cache.push("join_x", "0_0_0_1_energy", &99.0).unwrap_err();
        assert!(matches!(
            err,
            FlowError::KeyConflict { ref owner, ref producer, .. }
                if owner == "trial_a" && producer == "join_x"
        ));
        let values: Vec<f64> = cache.fetch("0_0_0_1_energy").unwrap();
        assert_eq!(values, vec![-1.5]);

        // and a pushed key cannot be claimed afterwards
        cache.push("join_a", "distance_to_state", &1).unwrap();
        assert!(cache.publish("select", "distance_to_state", &2).is_err());
        cache.push("join_b", "distance_to_state", &3).unwrap();
        assert_eq!(cache.fetch::<i32>("distance_to_state").unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_push_accumulates_and_filters_by_producer() {
        let cache = Cache::new();
        cache.push("join_a", "distance_to_state", &json!({"a": 1})).unwrap();
        cache.push("join_b", "distance_to_state", &json!({"b": 2})).unwrap();

        let all: Vec<Value> = cache.fetch("distance_to_state").unwrap();
        assert_eq!(all.len(), 2);

        let only_b: Vec<Value> = cache
            .fetch_from("distance_to_state", &["join_b".to_string()])
            .unwrap();
        assert_eq!(only_b, vec![json!({"b": 2})]);

        let none: Vec<Value> = cache.fetch("missing").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered_json() {
        let cache = Cache::new();
        cache.publish("n2", "b", &2).unwrap();
        cache.publish("n1", "a", &1).unwrap();
        let json = serialize_cache_to_prettyjson(&cache).unwrap();
        assert!(json.find("\"a\"").unwrap() < json.find("\"b\"").unwrap());
    }

    #[test]
    fn test_retry_delays() {
        let mut config = DagConfig::default();
        assert_eq!(config.retry_delay_ms(1), 2_000);
        assert_eq!(config.retry_delay_ms(2), 4_000);
        assert_eq!(config.retry_delay_ms(10), 60_000);

        config.retry_strategy = RetryStrategy::Linear { delay_ms: 5 };
        assert_eq!(config.retry_delay_ms(3), 5);
        config.retry_strategy = RetryStrategy::Immediate;
        assert_eq!(config.retry_delay_ms(3), 0);
    }

    #[test]
    fn test_config_validation_and_merge() {
        let bad = DagConfig {
            max_parallel_nodes: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let base = DagConfig {
            max_attempts: 3,
            ..Default::default()
        };
        let over = DagConfig {
            max_parallel_nodes: 16,
            ..Default::default()
        };
        let merged = DagConfig::merge(&base, &over).unwrap();
        assert_eq!(merged.max_parallel_nodes, 16);
        assert_eq!(merged.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_load_graph_rejects_cycles_and_unknown_deps() {
        let mut exec = executor();

        let cyclic = Graph {
            name: "cyclic".to_string(),
            description: String::new(),
            nodes: vec![node("a", &["b"]), node("b", &["a"])],
            config: None,
        };
        assert!(matches!(
            exec.load_graph(cyclic).await,
            Err(FlowError::InvalidGraph(_))
        ));

        let dangling = Graph {
            name: "dangling".to_string(),
            description: String::new(),
            nodes: vec![node("a", &["ghost"])],
            config: None,
        };
        assert!(matches!(
            exec.load_graph(dangling).await,
            Err(FlowError::DependencyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_node_at_runtime() {
        let mut exec = executor();
        let graph = Graph {
            name: "g".to_string(),
            description: String::new(),
            nodes: vec![node("a", &[])],
            config: None,
        };
        exec.load_graph(graph).await.unwrap();

        let id = exec
            .add_node(
                "g",
                NodeSpec::new("noop")
                    .with_id("b")
                    .with_deps(vec!["a".to_string()])
                    .with_branch("0_0_0"),
            )
            .await
            .unwrap();
        assert_eq!(id, "b");
        assert!(exec.node_exists("g", "b").await);
        assert_eq!(exec.get_node("g", "b").await.unwrap().dependencies, vec!["a"]);
        assert!(exec.branches.get_status("0_0_0").is_some());

        assert!(matches!(
            exec.add_node("g", NodeSpec::new("noop").with_id("b")).await,
            Err(FlowError::NodeAlreadyExists(_))
        ));
        assert!(matches!(
            exec.add_node("g", NodeSpec::new("missing_action")).await,
            Err(FlowError::ActionNotRegistered(_))
        ));
        assert!(matches!(
            exec.add_node("g", NodeSpec::new("noop").with_deps(vec!["zz".into()]))
                .await,
            Err(FlowError::DependencyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_graph_config_overrides_executor_defaults() {
        let mut exec = executor();
        let graph = Graph {
            name: "g".to_string(),
            description: String::new(),
            nodes: vec![node("a", &[])],
            config: Some(DagConfig {
                max_attempts: 5,
                default_timeout_secs: 30,
                ..Default::default()
            }),
        };
        exec.load_graph(graph).await.unwrap();
        assert_eq!(exec.config_for("g").await.max_attempts, 5);
        assert_eq!(exec.config_for("other").await, exec.config);

        exec.add_node("g", NodeSpec::new("noop").with_id("b"))
            .await
            .unwrap();
        let appended = exec.get_node("g", "b").await.unwrap();
        assert_eq!(appended.try_count, 5);
        assert_eq!(appended.timeout, 30);
    }
}
