//! Node actions of the adsorption workflow.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::engine::{InputProfile, SimulationEngine, SiteFinder};
use super::model::{slab_energy_key, Molecule, SiteKey, Structure};
use super::mutator::{MutationRequest, WorkflowMutator, OPTIMIZE_ACTION};
use super::selector::DistanceSelector;
use super::status_join::{join_statuses, StatusMap, DISTANCE_TO_STATE};
use super::store::TrialEnergyStore;
use crate::config::WorkflowConfig;
use crate::coord::{ActionRegistry, ExecutorCommand, NodeAction, NodeCtx, NodeOutput};
use crate::core::errors::FlowError;

pub const STATIC_TRIAL_ACTION: &str = "adsorption_static_trial";
pub const STATIC_ACTION: &str = "adsorption_static";
pub const JOB_STATUS_JOIN_ACTION: &str = "job_status_join";
pub const ANALYZE_ACTION: &str = "analyze_optimum_distance";
pub const LAUNCH_ACTION: &str = "launch_optimum_distance";

/// Collaborators and settings shared by every adsorption action
pub struct AdsorptionContext {
    pub engine: Arc<dyn SimulationEngine>,
    pub site_finder: Arc<dyn SiteFinder>,
    pub config: WorkflowConfig,
}

impl AdsorptionContext {
    pub fn new(
        engine: Arc<dyn SimulationEngine>,
        site_finder: Arc<dyn SiteFinder>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            engine,
            site_finder,
            config,
        }
    }

    fn static_profile(&self) -> InputProfile {
        self.launch_settings(
            InputProfile::static_landscape().with_overrides(self.config.static_overrides.clone()),
        )
    }

    fn optimize_profile(&self) -> InputProfile {
        self.launch_settings(
            InputProfile::surface_optimize().with_overrides(self.config.optimize_overrides.clone()),
        )
    }

    fn launch_settings(&self, profile: InputProfile) -> InputProfile {
        profile
            .with_command(self.config.vasp_cmd.clone())
            .with_db_file(self.config.db_file.clone())
    }
}

/// Register every adsorption action
pub fn register_adsorption_actions(registry: &ActionRegistry, ctx: Arc<AdsorptionContext>) {
    registry.register(Arc::new(StaticTrialAction { ctx: ctx.clone() }));
    registry.register(Arc::new(StaticAction { ctx: ctx.clone() }));
    registry.register(Arc::new(JobStatusJoinAction { ctx: ctx.clone() }));
    registry.register(Arc::new(AnalyzeOptimumDistanceAction { ctx: ctx.clone() }));
    registry.register(Arc::new(LaunchOptimumAction { ctx: ctx.clone() }));
    registry.register(Arc::new(OptimizeAction { ctx }));
}

/// One single-point evaluation at a fixed distance.
///
/// Inputs: `key`, `distance_idx`, `structure`.
pub struct StaticTrialAction {
    ctx: Arc<AdsorptionContext>,
}

#[async_trait]
impl NodeAction for StaticTrialAction {
    fn name(&self) -> &str {
        STATIC_TRIAL_ACTION
    }

    #[instrument(skip_all, fields(node_id = %ctx.node_id))]
    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let key: SiteKey = ctx.get_input("key")?;
        let distance_idx: usize = ctx.get_input("distance_idx")?;
        let structure: Structure = ctx.get_input("structure")?;

        let output = self
            .ctx
            .engine
            .run(&ctx.node_id, &structure, &self.ctx.static_profile())
            .await?;
        TrialEnergyStore::new(ctx.cache.clone()).record_trial(
            &ctx.node_id,
            &key,
            distance_idx,
            &output,
        )?;

        info!(idx = %key, distance_idx, energy = output.energy, "Trial finished");
        Ok(NodeOutput::success(json!({ "energy": output.energy })))
    }
}

/// Single point outside the decision chain: slab references and
/// adsorbate-only densities.
///
/// Inputs: `structure`, optional `slab_idx` (publishes the per-atom slab
/// reference energy), optional `energy_key`.
pub struct StaticAction {
    ctx: Arc<AdsorptionContext>,
}

#[async_trait]
impl NodeAction for StaticAction {
    fn name(&self) -> &str {
        STATIC_ACTION
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let structure: Structure = ctx.get_input("structure")?;
        if structure.is_empty() {
            anyhow::bail!("static calculation '{}' has an empty structure", ctx.name);
        }

        let output = self
            .ctx
            .engine
            .run(&ctx.node_id, &structure, &self.ctx.static_profile())
            .await?;

        if let Some(slab_idx) = ctx.get_input_opt::<usize>("slab_idx")? {
            let per_atom = output.energy / output.structure.len().max(1) as f64;
            TrialEnergyStore::new(ctx.cache.clone()).record_slab_energy(
                &ctx.node_id,
                slab_idx,
                per_atom,
            )?;
            info!(slab_idx, energy_per_atom = per_atom, "Slab reference published");
        }
        if let Some(key) = ctx.get_input_opt::<String>("energy_key")? {
            ctx.cache.publish(&ctx.node_id, &key, &output.energy)?;
        }

        Ok(NodeOutput::success(json!({ "energy": output.energy })))
    }
}

/// Maps the parents' completion records onto the distance set.
///
/// Inputs: `key`.
pub struct JobStatusJoinAction {
    ctx: Arc<AdsorptionContext>,
}

#[async_trait]
impl NodeAction for JobStatusJoinAction {
    fn name(&self) -> &str {
        JOB_STATUS_JOIN_ACTION
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let key: SiteKey = ctx.get_input("key")?;
        let states = join_statuses(&key, &self.ctx.config.distances, &ctx.job_info);

        let missing = self.ctx.config.distances.len() - states.len();
        if missing > 0 {
            warn!(idx = %key, missing, "Some distance trials left no completion record");
        }
        ctx.cache.push(&ctx.node_id, DISTANCE_TO_STATE, &states)?;
        Ok(NodeOutput::success(serde_json::to_value(&states)?))
    }
}

/// Selects the optimal distance and exits the branch on unfavorable sites.
///
/// Inputs: `key`, `adsorbate`.
pub struct AnalyzeOptimumDistanceAction {
    ctx: Arc<AdsorptionContext>,
}

#[async_trait]
impl NodeAction for AnalyzeOptimumDistanceAction {
    fn name(&self) -> &str {
        ANALYZE_ACTION
    }

    #[instrument(skip_all, fields(node_id = %ctx.node_id))]
    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let key: SiteKey = ctx.get_input("key")?;
        let adsorbate: Molecule = ctx.get_input("adsorbate")?;
        let idx = key.to_string();
        let store = TrialEnergyStore::new(ctx.cache.clone());

        let states: StatusMap = ctx
            .cache
            .fetch_from(DISTANCE_TO_STATE, &ctx.parents)?
            .into_iter()
            .next()
            .ok_or_else(|| FlowError::MissingKey {
                key: DISTANCE_TO_STATE.to_string(),
                node_id: ctx.node_id.clone(),
            })?;
        let trials = store.trials_for(&key, &self.ctx.config.distances, &states)?;

        let selection_config = &self.ctx.config.selection;
        let slab_energy = match store.slab_energy(key.slab_idx)? {
            Some(e) => e,
            None => selection_config
                .fallback_slab_energy
                .ok_or_else(|| FlowError::MissingKey {
                    key: slab_energy_key(key.slab_idx),
                    node_id: ctx.node_id.clone(),
                })?,
        };

        let selector = DistanceSelector::new(selection_config.clone());
        let selection = selector.select(&idx, &trials, slab_energy, &adsorbate.composition())?;
        store.publish_selection(&ctx.node_id, &key, &selection.result)?;

        let mut output = NodeOutput::success(serde_json::to_value(selection.result)?);
        if selection.unfavorable {
            let reason = format!(
                "adsorption energy {:.3} above threshold {}",
                selection.result.adsorption_energy, selection_config.unfavorable_threshold
            );
            info!(idx = %idx, "Unfavorable site: {}", reason);
            output = output.with_command(ExecutorCommand::ExitBranch {
                branch_id: ctx.branch.clone().unwrap_or(idx),
                reason: Some(reason),
            });
        } else {
            info!(
                idx = %idx,
                optimal_distance = selection.result.optimal_distance,
                adsorption_energy = selection.result.adsorption_energy,
                "Optimal distance selected"
            );
        }
        Ok(output)
    }
}

/// Appends the high-fidelity optimization at the selected distance.
///
/// Inputs: `key`, `original_slab`, `adsorbate`, `bulk_formula`.
pub struct LaunchOptimumAction {
    ctx: Arc<AdsorptionContext>,
}

#[async_trait]
impl NodeAction for LaunchOptimumAction {
    fn name(&self) -> &str {
        LAUNCH_ACTION
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let key: SiteKey = ctx.get_input("key")?;
        let slab: Structure = ctx.get_input("original_slab")?;
        let adsorbate: Molecule = ctx.get_input("adsorbate")?;
        let bulk_formula: String = ctx.get_input("bulk_formula")?;

        let selection = TrialEnergyStore::new(ctx.cache.clone()).selection_from(&key, &ctx.parents)?;
        let mutator = WorkflowMutator::new(
            self.ctx.site_finder.clone(),
            self.ctx.config.placement_params(),
        );
        let request = MutationRequest {
            key,
            dag_name: &ctx.dag_name,
            original_slab: &slab,
            adsorbate: &adsorbate,
            bulk_formula: &bulk_formula,
            parent_metadata: &ctx.metadata,
        };
        let command = mutator.mutate(&request, selection.as_ref())?;

        Ok(NodeOutput::success_empty().with_command(command))
    }
}

/// Relaxation with the surface profile.
///
/// Inputs: `structure`, `publish_prefix`.
pub struct OptimizeAction {
    ctx: Arc<AdsorptionContext>,
}

#[async_trait]
impl NodeAction for OptimizeAction {
    fn name(&self) -> &str {
        OPTIMIZE_ACTION
    }

    #[instrument(skip_all, fields(node_id = %ctx.node_id))]
    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let structure: Structure = ctx.get_input("structure")?;
        let prefix: String = ctx.get_input("publish_prefix")?;

        let output = self
            .ctx
            .engine
            .run(&ctx.node_id, &structure, &self.ctx.optimize_profile())
            .await?;
        TrialEnergyStore::new(ctx.cache.clone()).record_optimized(&ctx.node_id, &prefix, &output)?;

        info!(
            prefix = %prefix,
            energy = output.energy,
            optimal_distance = ?ctx.get_metadata::<f64>("optimal_distance"),
            "Optimization finished"
        );
        Ok(NodeOutput::success(json!({ "energy": output.energy })))
    }
}
