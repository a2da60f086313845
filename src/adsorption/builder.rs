//! Assembles the adsorption graph: trials, decision chains and references.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::info;

use super::actions::{
    ANALYZE_ACTION, JOB_STATUS_JOIN_ACTION, LAUNCH_ACTION, STATIC_ACTION, STATIC_TRIAL_ACTION,
};
use super::engine::{SiteFinder, SlabGenerator};
use super::model::{Molecule, SelectionResult, SiteKey, Structure};
use super::mutator::OPTIMIZE_ACTION;
use super::status_join::{DISTANCE_INDEX, SITE_KEY};
use super::store::TrialEnergyStore;
use crate::config::WorkflowConfig;
use crate::coord::{Coordinator, EventHook, LoggingHook, NodeSpec};
use crate::core::errors::Result;
use crate::dag_flow::{
    BranchStatus, Cache, DagExecutionReport, DagExecutor, Graph, Node,
};

pub fn trial_node_id(key: &SiteKey, distance_idx: usize) -> String {
    format!("trial_{}_{}", key, distance_idx)
}

pub fn join_node_id(key: &SiteKey) -> String {
    format!("join_{}", key)
}

pub fn analyze_node_id(key: &SiteKey) -> String {
    format!("analyze_{}", key)
}

pub fn launch_node_id(key: &SiteKey) -> String {
    format!("launch_{}", key)
}

pub fn slab_static_node_id(slab_idx: usize) -> String {
    format!("slab_static_{}", slab_idx)
}

/// A built, not yet executed, workflow
#[derive(Debug, Clone)]
pub struct AdsorptionWorkflow {
    pub name: String,
    pub graph: Graph,
    /// Every site with a decision chain, in build order
    pub sites: Vec<SiteKey>,
}

/// What happened to one site after a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteOutcome {
    pub key: SiteKey,
    pub selection: Option<SelectionResult>,
    pub branch: Option<BranchStatus>,
    pub optimized_energy: Option<f64>,
}

impl AdsorptionWorkflow {
    /// Load into the executor and run to completion
    pub async fn execute(
        &self,
        exec: &mut DagExecutor,
        cache: &Cache,
        cancel_rx: oneshot::Receiver<()>,
    ) -> Result<DagExecutionReport> {
        exec.load_graph(self.graph.clone()).await?;
        let hooks: Vec<Arc<dyn EventHook>> = vec![Arc::new(LoggingHook)];
        let event_capacity = exec.config_for(&self.name).await.event_capacity;
        Coordinator::new(hooks, event_capacity)
            .run_parallel(exec, cache, &self.name, &self.name, cancel_rx)
            .await
    }

    /// Per-site results read back from the namespace and branch registry
    pub fn site_outcomes(&self, exec: &DagExecutor, cache: &Cache) -> Result<Vec<SiteOutcome>> {
        let store = TrialEnergyStore::new(cache.clone());
        self.sites
            .iter()
            .map(|key| {
                Ok(SiteOutcome {
                    key: *key,
                    selection: cache.get(&key.to_string())?,
                    branch: exec.branches.get_status(&key.to_string()),
                    optimized_energy: store.optimized_energy(&key.to_string())?,
                })
            })
            .collect()
    }
}

/// Enumerates adsorbates × slabs × distances × sites into one graph.
pub struct AdsorptionWorkflowBuilder {
    bulk: Structure,
    adsorbates: Vec<Molecule>,
    config: WorkflowConfig,
    slab_generator: Arc<dyn SlabGenerator>,
    site_finder: Arc<dyn SiteFinder>,
}

impl AdsorptionWorkflowBuilder {
    pub fn new(
        bulk: Structure,
        adsorbates: Vec<Molecule>,
        config: WorkflowConfig,
        slab_generator: Arc<dyn SlabGenerator>,
        site_finder: Arc<dyn SiteFinder>,
    ) -> Self {
        Self {
            bulk,
            adsorbates,
            config,
            slab_generator,
            site_finder,
        }
    }

    fn metadata(&self, extra: Value) -> Value {
        let mut metadata = Map::new();
        if let Some(worker) = &self.config.worker {
            metadata.insert("worker".to_string(), json!(worker));
        }
        if let Value::Object(extra) = extra {
            metadata.extend(extra);
        }
        Value::Object(metadata)
    }

    fn node(&self, id: String, spec: NodeSpec) -> Node {
        Node::from_spec(id, spec, &self.config.executor)
    }

    pub fn build(&self) -> Result<AdsorptionWorkflow> {
        self.config.validate()?;
        let config = &self.config;
        let name = format!("Photocatalyst Workflow, Catalyst: {}", self.bulk.formula());
        let bulk_formula = self.bulk.formula();

        let slabs =
            self.slab_generator
                .generate_slabs(&self.bulk, config.max_index, &config.slab_params)?;

        let placement = config.placement_params();
        let mut nodes = Vec::new();
        let mut sites = Vec::new();

        if config.add_molecules_in_box {
            for (ads_idx, adsorbate) in self.adsorbates.iter().enumerate() {
                let id = format!("molecule_{}_optimize", ads_idx);
                nodes.push(self.node(
                    id,
                    NodeSpec::new(OPTIMIZE_ACTION)
                        .with_name(format!("{} molecule optimization", adsorbate.formula()))
                        .with_inputs(json!({
                            "structure": adsorbate.in_box(config.box_size),
                            "publish_prefix": format!("molecule_{}", ads_idx),
                        }))
                        .with_metadata(self.metadata(json!({}))),
                ));
            }
        }

        for (slab_idx, slab) in slabs.iter().enumerate() {
            if config.dos_slab {
                nodes.push(self.node(
                    slab_static_node_id(slab_idx),
                    NodeSpec::new(STATIC_ACTION)
                        .with_name(format!("Slab Static Calculation for {}", slab.miller_label()))
                        .with_inputs(json!({ "structure": slab, "slab_idx": slab_idx }))
                        .with_metadata(self.metadata(json!({}))),
                ));
            }
        }

        for (ads_idx, adsorbate) in self.adsorbates.iter().enumerate() {
            for (slab_idx, slab) in slabs.iter().enumerate() {
                let miller = slab.miller_label();

                if !config.optimize_distance {
                    let distance = config.selection.default_distance;
                    let structures = self.site_finder.adsorption_structures(
                        slab,
                        adsorbate,
                        distance,
                        &placement,
                    )?;
                    for (site_idx, structure) in structures.into_iter().enumerate() {
                        let key = SiteKey::new(ads_idx, slab_idx, site_idx);
                        nodes.push(self.node(
                            format!("{}_optimize", key),
                            NodeSpec::new(OPTIMIZE_ACTION)
                                .with_name(format!(
                                    "{}-{}{} adsorbate optimization: {}. Site: {}",
                                    adsorbate.formula(),
                                    bulk_formula,
                                    miller,
                                    distance,
                                    site_idx
                                ))
                                .with_branch(key.to_string())
                                .with_inputs(json!({
                                    "structure": structure,
                                    "publish_prefix": key.to_string(),
                                }))
                                .with_metadata(self.metadata(json!({
                                    SITE_KEY: key.to_string(),
                                    "optimal_distance": distance,
                                }))),
                        ));
                        sites.push(key);
                    }
                    continue;
                }

                let mut trials_by_site: BTreeMap<SiteKey, Vec<String>> = BTreeMap::new();
                for (distance_idx, distance) in config.distances.iter() {
                    let structures = self.site_finder.adsorption_structures(
                        slab,
                        adsorbate,
                        distance,
                        &placement,
                    )?;

                    for (site_idx, structure) in structures.into_iter().enumerate() {
                        let key = SiteKey::new(ads_idx, slab_idx, site_idx);

                        if config.dos_molecule {
                            nodes.push(self.node(
                                format!("adsorbate_static_{}_{}", key, distance_idx),
                                NodeSpec::new(STATIC_ACTION)
                                    .with_name(format!(
                                        "Adsorbate Static Calculation for Site: {} of {} at {}",
                                        site_idx, miller, distance
                                    ))
                                    .with_inputs(json!({
                                        "structure": structure.adsorbate_only(),
                                        "energy_key": format!("{}_{}_adsorbate_energy", key, distance_idx),
                                    }))
                                    .with_metadata(self.metadata(json!({
                                        SITE_KEY: key.to_string(),
                                    }))),
                            ));
                        }

                        let id = trial_node_id(&key, distance_idx);
                        nodes.push(self.node(
                            id.clone(),
                            NodeSpec::new(STATIC_TRIAL_ACTION)
                                .with_name(format!(
                                    "{}-{}{} distance optimization: {}. Site: {}",
                                    adsorbate.formula(),
                                    bulk_formula,
                                    miller,
                                    distance,
                                    site_idx
                                ))
                                .with_branch(key.to_string())
                                .with_inputs(json!({
                                    "key": key,
                                    "distance_idx": distance_idx,
                                    "structure": structure,
                                }))
                                .with_metadata(self.metadata(json!({
                                    SITE_KEY: key.to_string(),
                                    DISTANCE_INDEX: distance_idx,
                                    "distance": distance,
                                }))),
                        ));
                        trials_by_site.entry(key).or_default().push(id);
                    }
                }

                for (key, trial_ids) in trials_by_site {
                    nodes.extend(self.decision_chain(
                        &key,
                        trial_ids,
                        slab,
                        adsorbate,
                        &bulk_formula,
                    ));
                    sites.push(key);
                }
            }
        }

        info!(
            workflow = %name,
            slabs = slabs.len(),
            sites = sites.len(),
            nodes = nodes.len(),
            "Built adsorption workflow"
        );

        Ok(AdsorptionWorkflow {
            graph: Graph {
                name: name.clone(),
                description: format!(
                    "{} adsorbates on {} slabs of {}",
                    self.adsorbates.len(),
                    slabs.len(),
                    bulk_formula
                ),
                nodes,
                config: Some(config.executor.clone()),
            },
            name,
            sites,
        })
    }

    /// join → analyze → launch for one site
    fn decision_chain(
        &self,
        key: &SiteKey,
        trial_ids: Vec<String>,
        slab: &Structure,
        adsorbate: &Molecule,
        bulk_formula: &str,
    ) -> Vec<Node> {
        let branch = key.to_string();
        let site_metadata = self.metadata(json!({ SITE_KEY: key.to_string() }));
        let miller = slab.miller_label();

        let join = self.node(
            join_node_id(key),
            NodeSpec::new(JOB_STATUS_JOIN_ACTION)
                .with_name(format!("Job Status Join, Site: {} of {}", key.site_idx, miller))
                .with_deps(trial_ids)
                .allow_failed_parents()
                .with_branch(branch.clone())
                .with_inputs(json!({ "key": key }))
                .with_metadata(site_metadata.clone()),
        );

        let mut analyze_deps = vec![join.id.clone()];
        if self.config.dos_slab {
            analyze_deps.push(slab_static_node_id(key.slab_idx));
        }
        let analyze = self.node(
            analyze_node_id(key),
            NodeSpec::new(ANALYZE_ACTION)
                .with_name(format!(
                    "Optimal Distance Analysis, Adsorbate: {}, Surface: {}, Site: {}",
                    adsorbate.formula(),
                    miller,
                    key.site_idx
                ))
                .with_deps(analyze_deps)
                .allow_failed_parents()
                .with_branch(branch.clone())
                .with_inputs(json!({ "key": key, "adsorbate": adsorbate }))
                .with_metadata(site_metadata.clone()),
        );

        let launch = self.node(
            launch_node_id(key),
            NodeSpec::new(LAUNCH_ACTION)
                .with_name(format!("Launch Optimal Distance, Site: {} of {}", key.site_idx, miller))
                .with_deps(vec![analyze.id.clone()])
                .with_branch(branch)
                .with_inputs(json!({
                    "key": key,
                    "original_slab": slab,
                    "adsorbate": adsorbate,
                    "bulk_formula": bulk_formula,
                }))
                .with_metadata(site_metadata),
        );

        vec![join, analyze, launch]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adsorption::engine::PlacementParams;
    use crate::adsorption::model::Site;
    use crate::config::SlabParams;

    struct TwoSlabs;

    impl SlabGenerator for TwoSlabs {
        fn generate_slabs(
            &self,
            bulk: &Structure,
            _max_index: u32,
            _params: &SlabParams,
        ) -> Result<Vec<Structure>> {
            Ok(vec![
                bulk.clone().with_miller_index([1, 0, 0]),
                bulk.clone().with_miller_index([1, 1, 1]),
            ])
        }
    }

    struct NSites(usize);

    impl SiteFinder for NSites {
        fn adsorption_structures(
            &self,
            slab: &Structure,
            adsorbate: &Molecule,
            distance: f64,
            _params: &PlacementParams,
        ) -> Result<Vec<Structure>> {
            Ok((0..self.0)
                .map(|i| {
                    let mut s = slab.clone();
                    s.sites.extend(
                        adsorbate
                            .sites
                            .iter()
                            .map(|a| Site::adsorbate(a.species.clone(), [i as f64, 0.0, distance])),
                    );
                    s
                })
                .collect())
        }
    }

    fn builder(config: WorkflowConfig) -> AdsorptionWorkflowBuilder {
        let bulk = Structure::new(
            [[3.9, 0.0, 0.0], [0.0, 3.9, 0.0], [0.0, 0.0, 3.9]],
            vec![Site::new("Pt", [0.0; 3])],
        );
        let water = Molecule::new(vec![
            Site::new("O", [0.0; 3]),
            Site::new("H", [0.76, 0.59, 0.0]),
            Site::new("H", [-0.76, 0.59, 0.0]),
        ]);
        AdsorptionWorkflowBuilder::new(
            bulk,
            vec![water],
            config,
            Arc::new(TwoSlabs),
            Arc::new(NSites(2)),
        )
    }

    fn find<'a>(wf: &'a AdsorptionWorkflow, id: &str) -> &'a Node {
        wf.graph.nodes.iter().find(|n| n.id == id).unwrap()
    }

    #[test]
    fn test_full_enumeration() {
        let wf = builder(WorkflowConfig::default()).build().unwrap();
        assert_eq!(wf.name, "Photocatalyst Workflow, Catalyst: Pt");
        // 2 slabs × 2 sites
        assert_eq!(wf.sites.len(), 4);

        let count = |action: &str| wf.graph.nodes.iter().filter(|n| n.action == action).count();
        assert_eq!(count(STATIC_TRIAL_ACTION), 4 * 5);
        // slab statics plus adsorbate-only statics
        assert_eq!(count(STATIC_ACTION), 2 + 4 * 5);
        assert_eq!(count(JOB_STATUS_JOIN_ACTION), 4);
        assert_eq!(count(ANALYZE_ACTION), 4);
        assert_eq!(count(LAUNCH_ACTION), 4);
        assert_eq!(count(OPTIMIZE_ACTION), 0);
    }

    #[test]
    fn test_trial_wiring_and_metadata() {
        let config = WorkflowConfig {
            worker: Some("node-7".to_string()),
            ..Default::default()
        };
        let wf = builder(config).build().unwrap();
        let key = SiteKey::new(0, 1, 1);

        let trial = find(&wf, &trial_node_id(&key, 2));
        assert_eq!(trial.name, "H2O-Pt(1, 1, 1) distance optimization: 1.25. Site: 1");
        assert_eq!(trial.metadata[DISTANCE_INDEX], 2);
        assert_eq!(trial.metadata[SITE_KEY], "0_1_1");
        assert_eq!(trial.metadata["worker"], "node-7");
        assert_eq!(trial.branch.as_deref(), Some("0_1_1"));

        let join = find(&wf, &join_node_id(&key));
        assert!(join.allow_failed_parents);
        assert_eq!(
            join.dependencies,
            (0..5).map(|d| trial_node_id(&key, d)).collect::<Vec<_>>()
        );

        let analyze = find(&wf, &analyze_node_id(&key));
        assert_eq!(
            analyze.name,
            "Optimal Distance Analysis, Adsorbate: H2O, Surface: (1, 1, 1), Site: 1"
        );
        assert_eq!(analyze.dependencies, vec![join_node_id(&key), slab_static_node_id(1)]);

        let launch = find(&wf, &launch_node_id(&key));
        assert!(!launch.allow_failed_parents);
        assert_eq!(launch.dependencies, vec![analyze_node_id(&key)]);
    }

    #[test]
    fn test_optional_nodes_follow_flags() {
        let config = WorkflowConfig {
            dos_slab: false,
            dos_molecule: false,
            add_molecules_in_box: true,
            ..Default::default()
        };
        let wf = builder(config).build().unwrap();
        assert!(wf.graph.nodes.iter().all(|n| n.action != STATIC_ACTION));
        assert_eq!(find(&wf, "molecule_0_optimize").action, OPTIMIZE_ACTION);

        let analyze = find(&wf, &analyze_node_id(&SiteKey::new(0, 0, 0)));
        assert_eq!(analyze.dependencies, vec![join_node_id(&SiteKey::new(0, 0, 0))]);
    }

    #[test]
    fn test_without_distance_search_optimizes_directly() {
        let config = WorkflowConfig {
            optimize_distance: false,
            ..Default::default()
        };
        let wf = builder(config).build().unwrap();
        assert!(wf.graph.nodes.iter().all(|n| n.action != STATIC_TRIAL_ACTION));
        let node = find(&wf, "0_0_1_optimize");
        assert_eq!(node.metadata["optimal_distance"], 2.0);
        assert_eq!(wf.sites.len(), 4);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = WorkflowConfig {
            max_index: 0,
            ..Default::default()
        };
        assert!(builder(config).build().is_err());
    }
}
