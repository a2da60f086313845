//! Runs the distance search against a toy engine.
//!
//! Usage: `adsorbflow-demo [workflow.yaml]`. Logging follows `RUST_LOG`.

use adsorbflow::config::SlabParams;
use adsorbflow::coord::ActionRegistry;
use adsorbflow::dag_flow::{serialize_cache_to_prettyjson, Cache, DagExecutor, LoggingEventSink};
use adsorbflow::{
    register_adsorption_actions, AdsorptionContext, AdsorptionWorkflowBuilder, EngineOutput,
    FlowError, InputProfile, Molecule, PlacementParams, ReferenceEnergies, Result,
    SimulationEngine, Site, SiteFinder, SlabGenerator, Structure, WorkflowConfig,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SITE_SPACING: f64 = 1.4;

/// Morse well per site; the last site is purely repulsive
struct ToyEngine {
    wells: Vec<(f64, f64)>,
}

impl ToyEngine {
    fn per_atom_energy(&self, site_idx: usize, height: f64) -> f64 {
        match self.wells.get(site_idx) {
            Some(&(depth, r0)) => {
                let x = 1.0 - (-1.8 * (height - r0)).exp();
                depth * (x * x - 1.0)
            }
            None => 1.5 + (-height).exp(),
        }
    }
}

#[async_trait]
impl SimulationEngine for ToyEngine {
    async fn run(
        &self,
        task: &str,
        structure: &Structure,
        profile: &InputProfile,
    ) -> Result<EngineOutput> {
        tokio::time::sleep(Duration::from_millis(20)).await;

        let surface = structure
            .slab_only()
            .sites
            .iter()
            .map(|s| s.coords[2])
            .fold(0.0_f64, f64::max);
        let placed = structure.adsorbate_only();
        let energy = match placed.sites.first() {
            None => 0.0,
            Some(first) => {
                let site_idx = (first.coords[0] / SITE_SPACING).round() as usize;
                let height = first.coords[2] - surface;
                if height <= 0.0 {
                    return Err(FlowError::engine(task, "adsorbate below the surface"));
                }
                let per_atom = self.per_atom_energy(site_idx, height);
                if profile.name == "surface_optimize" {
                    // relaxation settles a little deeper
                    (per_atom - 0.05) * structure.len() as f64
                } else {
                    per_atom * structure.len() as f64
                }
            }
        };
        Ok(EngineOutput {
            energy,
            structure: structure.clone(),
        })
    }
}

/// A single (1, 1, 1) termination, two layers deep
struct ToySlabs;

impl SlabGenerator for ToySlabs {
    fn generate_slabs(
        &self,
        bulk: &Structure,
        _max_index: u32,
        params: &SlabParams,
    ) -> Result<Vec<Structure>> {
        let mut slab = bulk.clone().with_miller_index([1, 1, 1]);
        slab.lattice[2][2] = params.min_slab_size + params.min_vacuum_size;
        let layer: Vec<Site> = slab
            .sites
            .iter()
            .map(|s| Site::new(s.species.clone(), [s.coords[0], s.coords[1], s.coords[2] - 2.3]))
            .collect();
        slab.sites.extend(layer);
        Ok(vec![slab])
    }
}

struct ToySites(usize);

impl SiteFinder for ToySites {
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
                s.sites.extend(adsorbate.sites.iter().map(|a| {
                    Site::adsorbate(
                        a.species.clone(),
                        [
                            i as f64 * SITE_SPACING + a.coords[0],
                            a.coords[1],
                            distance + a.coords[2],
                        ],
                    )
                }));
                s
            })
            .collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => WorkflowConfig::from_yaml_file(path)?,
        None => WorkflowConfig::default(),
    };
    if config.selection.reference_energies == ReferenceEnergies::default() {
        config.selection.reference_energies = ReferenceEnergies(
            [("H".to_string(), 0.0), ("O".to_string(), 0.0)].into_iter().collect(),
        );
    }

    let bulk = Structure::new(
        [[2.77, 0.0, 0.0], [1.385, 2.399, 0.0], [0.0, 0.0, 6.79]],
        vec![Site::new("Pt", [0.0, 0.0, 0.0]), Site::new("Pt", [1.385, 0.8, 0.0])],
    );
    let water = Molecule::new(vec![
        Site::new("O", [0.0, 0.0, 0.0]),
        Site::new("H", [0.757, 0.0, 0.586]),
        Site::new("H", [-0.757, 0.0, 0.586]),
    ]);

    let site_finder = Arc::new(ToySites(3));
    let engine = Arc::new(ToyEngine {
        wells: vec![(0.6, 1.3), (0.35, 1.6)],
    });

    let workflow = AdsorptionWorkflowBuilder::new(
        bulk,
        vec![water],
        config.clone(),
        Arc::new(ToySlabs),
        site_finder.clone(),
    )
    .build()?;
    info!(workflow = %workflow.name, nodes = workflow.graph.nodes.len(), "Workflow ready");

    let registry = ActionRegistry::new();
    register_adsorption_actions(
        &registry,
        Arc::new(AdsorptionContext::new(engine, site_finder, config.clone())),
    );
    let mut exec = DagExecutor::new(Some(config.executor.clone()), registry)?;
    exec.set_event_sink(Arc::new(LoggingEventSink));
    let cache = Cache::new();

    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let report = workflow.execute(&mut exec, &cache, cancel_rx).await?;

    println!("\n=== {} ===", workflow.name);
    println!(
        "overall success: {} ({} nodes)",
        report.overall_success,
        report.node_outcomes.len()
    );
    for outcome in workflow.site_outcomes(&exec, &cache)? {
        println!("{}", serde_json::to_string(&outcome)?);
    }
    if std::env::var_os("ADSORBFLOW_DUMP_CACHE").is_some() {
        println!("{}", exec.serialize_graph_to_json(&workflow.name).await?);
        println!("{}", serialize_cache_to_prettyjson(&cache)?);
    }
    Ok(())
}
