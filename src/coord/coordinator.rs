//! Coordinator - the heart of parallel execution
//!
//! The Coordinator orchestrates parallel node execution using channels.
//! Workers only report events; every graph mutation requested by a node or
//! a hook is applied here, which is the only place holding `&mut DagExecutor`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::Direction;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::coord::action::{NodeAction, NodeCtx};
use crate::coord::hooks::{EventHook, HookContext};
use crate::coord::types::{ExecutionEvent, ExecutorCommand, JobInfo, NodeOutcome, NodeRef};
use crate::core::errors::{FlowError, Result};
use crate::dag_flow::events::RuntimeEvent;
use crate::dag_flow::{
    create_execution_report, Cache, DagConfig, DagExecutionReport, DagExecutor, Node,
    NodeExecutionOutcome, NodeStatus,
};
use crate::emit_event;

/// Coordinator for parallel DAG execution
pub struct Coordinator {
    evt_tx: mpsc::Sender<ExecutionEvent>,
    evt_rx: mpsc::Receiver<ExecutionEvent>,
    // Hooks that process events
    hooks: Vec<Arc<dyn EventHook>>,
}

/// What to do with a node whose parents are all terminal
enum Decision {
    Run { node: Node, job_info: Vec<JobInfo> },
    Skip { status: NodeStatus, reason: String },
}

impl Coordinator {
    /// Create a new coordinator
    pub fn new(hooks: Vec<Arc<dyn EventHook>>, cap_events: usize) -> Self {
        let (evt_tx, evt_rx) = mpsc::channel(cap_events.max(1));
        Self {
            evt_tx,
            evt_rx,
            hooks,
        }
    }

    /// Run a loaded DAG to completion.
    ///
    /// Nodes become ready once every parent is terminal. Ready nodes run on
    /// at most `max_parallel_nodes` workers. Commands returned by nodes are
    /// applied before the node is recorded as completed, so appended nodes
    /// are scheduled in the same sweep as the node's other children.
    pub async fn run_parallel(
        self,
        exec: &mut DagExecutor,
        cache: &Cache,
        dag_name: &str,
        run_id: &str,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> Result<DagExecutionReport> {
        if !exec.prebuilt_dags.read().await.contains_key(dag_name) {
            return Err(FlowError::DagNotFound(dag_name.to_string()));
        }

        let Coordinator {
            evt_tx,
            mut evt_rx,
            hooks,
        } = self;

        let config = exec.config_for(dag_name).await;
        let max_parallel = config.max_parallel_nodes.max(1);
        let mut run = Run {
            config,
            exec,
            cache: cache.clone(),
            dag_name: dag_name.to_string(),
            run_id: run_id.to_string(),
            hook_ctx: HookContext::new(run_id, dag_name, cache.clone()),
            hooks,
            statuses: HashMap::new(),
            in_flight: HashSet::new(),
            outcomes: Vec::new(),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            evt_tx,
        };

        for hook in run.hooks.clone() {
            let cmds = hook.on_start(&run.hook_ctx).await;
            for cmd in cmds {
                run.apply_command(None, cmd).await?;
            }
        }

        run.schedule_ready().await?;

        let mut cancelled = false;
        let mut cancel_closed = false;
        while !run.in_flight.is_empty() {
            tokio::select! {
                Some(event) = evt_rx.recv() => {
                    run.handle_event(event).await?;
                }
                res = &mut cancel_rx, if !cancel_closed => {
                    match res {
                        Ok(()) => {
                            info!(dag = %dag_name, "Coordinator received cancel signal");
                            cancelled = true;
                            break;
                        }
                        // Sender dropped without cancelling.
                        Err(_) => cancel_closed = true,
                    }
                }
            }
        }

        let report = run.finish(cancelled).await?;
        Ok(report)
    }
}

/// Mutable state of one coordinator run
struct Run<'a> {
    exec: &'a mut DagExecutor,
    config: DagConfig,
    cache: Cache,
    dag_name: String,
    run_id: String,
    hook_ctx: HookContext,
    hooks: Vec<Arc<dyn EventHook>>,
    /// Terminal statuses only
    statuses: HashMap<String, NodeStatus>,
    in_flight: HashSet<String>,
    outcomes: Vec<NodeExecutionOutcome>,
    semaphore: Arc<Semaphore>,
    evt_tx: mpsc::Sender<ExecutionEvent>,
}

impl<'a> Run<'a> {
    fn node_ref(&self, node_id: &str) -> NodeRef {
        NodeRef {
            dag_name: self.dag_name.clone(),
            node_id: node_id.to_string(),
        }
    }

    async fn handle_event(&mut self, event: ExecutionEvent) -> Result<()> {
        self.run_hooks(&event).await?;

        match event {
            ExecutionEvent::NodeStarted { node, attempt } => {
                let action = self
                    .exec
                    .get_node(&self.dag_name, &node.node_id)
                    .await
                    .map(|n| n.action)
                    .unwrap_or_default();
                emit_event!(
                    self.exec,
                    self.run_id,
                    RuntimeEvent::NodeStarted {
                        node_id: node.node_id,
                        action,
                        attempt,
                    }
                );
            }
            ExecutionEvent::NodeCompleted {
                node,
                outcome,
                retry_messages,
            } => {
                self.in_flight.remove(&node.node_id);
                let mut final_error = None;
                for cmd in outcome.commands {
                    if let Err(e) = self.apply_command(Some(&node.node_id), cmd).await {
                        error!(node_id = %node.node_id, "Rejected command: {}", e);
                        final_error = Some(e.to_string());
                        break;
                    }
                }
                match final_error {
                    None => self.record(&node.node_id, NodeStatus::Completed, retry_messages, None),
                    Some(e) => self.record_failure(&node.node_id, e, retry_messages).await,
                }
                self.schedule_ready().await?;
            }
            ExecutionEvent::NodeFailed {
                node,
                error,
                retry_messages,
            } => {
                self.in_flight.remove(&node.node_id);
                self.record_failure(&node.node_id, error, retry_messages)
                    .await;
                self.schedule_ready().await?;
            }
            ExecutionEvent::NodeSkipped { .. } => {}
        }
        Ok(())
    }

    async fn run_hooks(&mut self, event: &ExecutionEvent) -> Result<()> {
        for hook in self.hooks.clone() {
            let cmds = hook.handle(&self.hook_ctx, event).await;
            for cmd in cmds {
                self.apply_command(None, cmd).await?;
            }
        }
        Ok(())
    }

    fn record(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        retry_messages: Vec<String>,
        final_error: Option<String>,
    ) {
        if let NodeStatus::Completed | NodeStatus::Failed = status {
            emit_event!(
                self.exec,
                self.run_id,
                RuntimeEvent::NodeCompleted {
                    node_id: node_id.to_string(),
                    success: status.is_success(),
                    duration_ms: 0,
                }
            );
        }
        self.statuses.insert(node_id.to_string(), status);
        self.outcomes.push(NodeExecutionOutcome {
            node_id: node_id.to_string(),
            status,
            retry_messages,
            final_error,
        });
    }

    async fn record_failure(&mut self, node_id: &str, error: String, retry_messages: Vec<String>) {
        self.record(node_id, NodeStatus::Failed, retry_messages, Some(error.clone()));

        // A failing sink leaves nothing downstream to tolerate it.
        let (branch, is_sink) = {
            let dags = self.exec.prebuilt_dags.read().await;
            match dags.get(&self.dag_name) {
                Some((graph, node_map)) => match node_map.get(node_id) {
                    Some(&idx) => (
                        graph[idx].branch.clone(),
                        graph.neighbors_directed(idx, Direction::Outgoing).next().is_none(),
                    ),
                    None => (None, false),
                },
                None => (None, false),
            }
        };
        if let (Some(branch), true) = (branch, is_sink) {
            self.fail_branch(&branch, &error, node_id);
        }
    }

    fn fail_branch(&self, branch: &str, reason: &str, by: &str) {
        self.exec.branches.fail_branch(branch, Some(reason), by);
        emit_event!(
            self.exec,
            self.run_id,
            RuntimeEvent::BranchStateUpdated {
                branch_id: branch.to_string(),
                status: "failed".to_string(),
                reason: Some(reason.to_string()),
            }
        );
    }

    /// Apply a command. `parent` is the node that returned it, if any.
    async fn apply_command(&mut self, parent: Option<&str>, cmd: ExecutorCommand) -> Result<()> {
        match cmd {
            ExecutorCommand::AddNodes { dag_name, specs } => {
                if dag_name != self.dag_name {
                    return Err(FlowError::DagNotFound(dag_name));
                }
                let parent_branch = match parent {
                    Some(p) => self
                        .exec
                        .get_node(&self.dag_name, p)
                        .await
                        .and_then(|n| n.branch),
                    None => None,
                };
                let mut node_ids = Vec::with_capacity(specs.len());
                for mut spec in specs {
                    if let Some(p) = parent {
                        if !spec.deps.iter().any(|d| d == p) {
                            spec.deps.push(p.to_string());
                        }
                    }
                    if spec.branch.is_none() {
                        spec.branch = parent_branch.clone();
                    }
                    let id = self.exec.add_node(&self.dag_name, spec).await?;
                    node_ids.push(id);
                }
                info!(parent = parent.unwrap_or("hook"), nodes = ?node_ids, "Appended nodes");
                emit_event!(
                    self.exec,
                    self.run_id,
                    RuntimeEvent::NodesAppended {
                        parent: parent.unwrap_or_default().to_string(),
                        node_ids,
                    }
                );
            }
            ExecutorCommand::ExitBranch { branch_id, reason } => {
                info!(branch = %branch_id, reason = ?reason, "Exiting branch");
                self.exec
                    .branches
                    .exit_branch(&branch_id, reason.as_deref(), parent.unwrap_or("hook"));
                emit_event!(
                    self.exec,
                    self.run_id,
                    RuntimeEvent::BranchStateUpdated {
                        branch_id,
                        status: "exited".to_string(),
                        reason,
                    }
                );
            }
        }
        Ok(())
    }

    /// Decide every node whose parents are terminal, until nothing changes.
    async fn schedule_ready(&mut self) -> Result<()> {
        loop {
            let decisions = self.ready_decisions().await?;
            if decisions.is_empty() {
                return Ok(());
            }
            for (node_id, decision) in decisions {
                match decision {
                    Decision::Run { node, job_info } => {
                        self.in_flight.insert(node_id);
                        self.spawn_worker(node, job_info).await?;
                    }
                    Decision::Skip { status, reason } => {
                        debug!(node_id = %node_id, ?status, "Skipping node: {}", reason);
                        if status == NodeStatus::Skipped {
                            let branch = self
                                .exec
                                .get_node(&self.dag_name, &node_id)
                                .await
                                .and_then(|n| n.branch);
                            if let Some(branch) = branch {
                                self.fail_branch(&branch, &reason, &node_id);
                            }
                        }
                        emit_event!(
                            self.exec,
                            self.run_id,
                            RuntimeEvent::NodeSkipped {
                                node_id: node_id.clone(),
                                reason: reason.clone(),
                            }
                        );
                        self.record(&node_id, status, Vec::new(), None);
                        let event = ExecutionEvent::NodeSkipped {
                            node: self.node_ref(&node_id),
                            status,
                            reason,
                        };
                        self.run_hooks(&event).await?;
                    }
                }
            }
        }
    }

    async fn ready_decisions(&self) -> Result<Vec<(String, Decision)>> {
        let dags = self.exec.prebuilt_dags.read().await;
        let (graph, node_map) = dags
            .get(&self.dag_name)
            .ok_or_else(|| FlowError::DagNotFound(self.dag_name.clone()))?;

        let mut decisions = Vec::new();
        for (node_id, &node_idx) in node_map.iter() {
            if self.statuses.contains_key(node_id) || self.in_flight.contains(node_id) {
                continue;
            }

            let parents: Vec<&Node> = graph
                .neighbors_directed(node_idx, Direction::Incoming)
                .map(|i| &graph[i])
                .collect();
            let parent_statuses: Option<Vec<NodeStatus>> = parents
                .iter()
                .map(|p| self.statuses.get(&p.id).copied())
                .collect();
            let parent_statuses = match parent_statuses {
                Some(s) => s,
                None => continue,
            };

            let node = &graph[node_idx];
            let decision = if node
                .branch
                .as_deref()
                .map_or(false, |b| self.exec.branches.is_exited(b))
            {
                Decision::Skip {
                    status: NodeStatus::Exited,
                    reason: format!("branch {} exited", node.branch.as_deref().unwrap_or_default()),
                }
            } else if let Some((parent, status)) = parents
                .iter()
                .zip(&parent_statuses)
                .find(|(_, s)| !s.is_success())
                .filter(|_| !node.allow_failed_parents)
            {
                Decision::Skip {
                    status: NodeStatus::Skipped,
                    reason: format!("parent {} is {:?}", parent.id, status),
                }
            } else {
                let job_info = parents
                    .iter()
                    .zip(parent_statuses)
                    .map(|(p, status)| JobInfo {
                        node_id: p.id.clone(),
                        name: p.name.clone(),
                        status,
                        metadata: p.metadata.clone(),
                    })
                    .collect();
                Decision::Run {
                    node: node.clone(),
                    job_info,
                }
            };
            decisions.push((node_id.clone(), decision));
        }

        // Deterministic launch order within a sweep.
        decisions.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(decisions)
    }

    /// Spawn a worker task to execute a node
    async fn spawn_worker(&mut self, node: Node, job_info: Vec<JobInfo>) -> Result<()> {
        let action = self.exec.function_registry.resolve(&node.action)?;

        let parents = job_info.iter().map(|j| j.node_id.clone()).collect();
        let mut ctx = NodeCtx::new(
            self.dag_name.clone(),
            node.id.clone(),
            node.inputs.clone(),
            self.cache.clone(),
        )
        .with_metadata(node.metadata.clone())
        .with_parents(parents, job_info);
        ctx.name = node.name.clone();
        ctx.branch = node.branch.clone();

        let worker = Worker {
            node_ref: self.node_ref(&node.id),
            action,
            ctx,
            timeout: Duration::from_secs(node.timeout),
            try_count: node.try_count.max(1),
            config: self.config.clone(),
            evt_tx: self.evt_tx.clone(),
        };
        let sem = self.semaphore.clone();

        tokio::spawn(async move {
            let node_ref = worker.node_ref.clone();
            let evt_tx = worker.evt_tx.clone();
            match sem.acquire_owned().await {
                Ok(_permit) => run_worker(worker).await,
                Err(e) => {
                    let _ = evt_tx
                        .send(ExecutionEvent::NodeFailed {
                            node: node_ref,
                            error: format!("worker pool closed: {}", e),
                            retry_messages: Vec::new(),
                        })
                        .await;
                }
            }
        });

        Ok(())
    }

    async fn finish(mut self, cancelled: bool) -> Result<DagExecutionReport> {
        // Anything never decided is unreachable or was cut off by cancellation.
        let remaining: Vec<String> = self
            .exec
            .node_ids(&self.dag_name)
            .await?
            .into_iter()
            .filter(|id| !self.statuses.contains_key(id))
            .collect();
        for node_id in remaining {
            let reason = if cancelled { "run cancelled" } else { "never became ready" };
            if !cancelled {
                warn!(node_id = %node_id, "Node {}", reason);
            }
            self.outcomes.push(NodeExecutionOutcome {
                node_id,
                status: NodeStatus::Skipped,
                retry_messages: Vec::new(),
                final_error: Some(reason.to_string()),
            });
        }

        for (branch, state) in self.exec.branches.list_branches() {
            if state.status == crate::dag_flow::BranchStatus::Running && !cancelled {
                self.exec.branches.complete_branch(&branch);
            }
        }

        let mut report = create_execution_report(
            self.outcomes,
            cancelled.then(|| "run cancelled".to_string()),
        );
        if cancelled {
            report.overall_success = false;
        }

        for hook in &self.hooks {
            hook.on_complete(&self.hook_ctx, report.overall_success).await;
        }
        info!(
            dag = %self.dag_name,
            completed = report.count(NodeStatus::Completed),
            failed = report.count(NodeStatus::Failed),
            skipped = report.count(NodeStatus::Skipped),
            exited = report.count(NodeStatus::Exited),
            "DAG execution finished"
        );
        Ok(report)
    }
}

/// One node's execution, including retries
struct Worker {
    node_ref: NodeRef,
    action: Arc<dyn NodeAction>,
    ctx: NodeCtx,
    timeout: Duration,
    try_count: u8,
    config: DagConfig,
    evt_tx: mpsc::Sender<ExecutionEvent>,
}

#[instrument(skip_all, fields(node_id = %worker.node_ref.node_id))]
async fn run_worker(worker: Worker) {
    let mut retry_messages = Vec::new();

    for attempt in 1..=worker.try_count {
        let _ = worker
            .evt_tx
            .send(ExecutionEvent::NodeStarted {
                node: worker.node_ref.clone(),
                attempt,
            })
            .await;

        let started = Instant::now();
        let action = worker.action.clone();
        let ctx = worker.ctx.clone();
        // Panics inside the action surface as a join error.
        let mut handle = tokio::spawn(async move { action.execute(&ctx).await });

        let mut retryable = true;
        let error = match tokio::time::timeout(worker.timeout, &mut handle).await {
            Ok(Ok(Ok(output))) if output.success => {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Action succeeded");
                let _ = worker
                    .evt_tx
                    .send(ExecutionEvent::NodeCompleted {
                        node: worker.node_ref.clone(),
                        outcome: NodeOutcome {
                            outputs: output.outputs,
                            commands: output.commands,
                        },
                        retry_messages,
                    })
                    .await;
                return;
            }
            Ok(Ok(Ok(_))) => "action reported failure".to_string(),
            Ok(Ok(Err(e))) => {
                if let Some(flow_err) = e.downcast_ref::<FlowError>() {
                    retryable = flow_err.is_retryable();
                }
                format!("{:#}", e)
            }
            Ok(Err(join_err)) => format!("worker task error: {}", join_err),
            Err(_) => {
                handle.abort();
                format!("timed out after {}s", worker.timeout.as_secs())
            }
        };

        if retryable && attempt < worker.try_count {
            let delay = worker.config.retry_delay_ms(attempt);
            warn!(attempt, delay_ms = delay, "Attempt failed: {}", error);
            retry_messages.push(error);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        } else {
            if !retryable {
                debug!(attempt, "Error is not retryable");
            }
            let _ = worker
                .evt_tx
                .send(ExecutionEvent::NodeFailed {
                    node: worker.node_ref.clone(),
                    error,
                    retry_messages,
                })
                .await;
            return;
        }
    }
}
